use std::{
    collections::HashMap,
    fmt::Write as _,
    sync::{Mutex, OnceLock},
};

static METRICS_STATE: OnceLock<MetricsState> = OnceLock::new();

#[derive(Default)]
pub(crate) struct MetricsState {
    pub(crate) auth_failures: Mutex<HashMap<&'static str, u64>>,
    pub(crate) rate_limit_hits: Mutex<HashMap<(&'static str, &'static str), u64>>,
    pub(crate) ws_disconnects: Mutex<HashMap<&'static str, u64>>,
    pub(crate) gateway_events_emitted: Mutex<HashMap<(&'static str, &'static str), u64>>,
    pub(crate) gateway_events_dropped:
        Mutex<HashMap<(&'static str, &'static str, &'static str), u64>>,
}

pub(crate) fn metrics_state() -> &'static MetricsState {
    METRICS_STATE.get_or_init(MetricsState::default)
}

pub(crate) fn record_auth_failure(reason: &'static str) {
    if let Ok(mut failures) = metrics_state().auth_failures.lock() {
        *failures.entry(reason).or_default() += 1;
    }
}

pub(crate) fn record_rate_limit_hit(surface: &'static str, reason: &'static str) {
    if let Ok(mut hits) = metrics_state().rate_limit_hits.lock() {
        *hits.entry((surface, reason)).or_default() += 1;
    }
}

pub(crate) fn record_ws_disconnect(reason: &'static str) {
    if let Ok(mut disconnects) = metrics_state().ws_disconnects.lock() {
        *disconnects.entry(reason).or_default() += 1;
    }
}

pub(crate) fn record_gateway_event_emitted(scope: &'static str, op: &'static str) {
    if let Ok(mut emitted) = metrics_state().gateway_events_emitted.lock() {
        *emitted.entry((scope, op)).or_default() += 1;
    }
}

pub(crate) fn record_gateway_event_dropped(
    scope: &'static str,
    op: &'static str,
    reason: &'static str,
) {
    if let Ok(mut dropped) = metrics_state().gateway_events_dropped.lock() {
        *dropped.entry((scope, op, reason)).or_default() += 1;
    }
}

pub(crate) fn render_metrics() -> String {
    let auth_failures = metrics_state()
        .auth_failures
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let rate_limit_hits = metrics_state()
        .rate_limit_hits
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let ws_disconnects = metrics_state()
        .ws_disconnects
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let gateway_events_emitted = metrics_state()
        .gateway_events_emitted
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let gateway_events_dropped = metrics_state()
        .gateway_events_dropped
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());

    let mut output = String::new();
    output.push_str("# HELP hearth_auth_failures_total Count of auth-related failures by reason\n");
    output.push_str("# TYPE hearth_auth_failures_total counter\n");
    let mut auth_entries: Vec<_> = auth_failures.into_iter().collect();
    auth_entries.sort_by_key(|(reason, _)| *reason);
    for (reason, value) in auth_entries {
        let _ = writeln!(
            output,
            "hearth_auth_failures_total{{reason=\"{reason}\"}} {value}"
        );
    }

    output
        .push_str("# HELP hearth_rate_limit_hits_total Count of rate-limit rejections by surface\n");
    output.push_str("# TYPE hearth_rate_limit_hits_total counter\n");
    let mut rate_entries: Vec<_> = rate_limit_hits.into_iter().collect();
    rate_entries.sort_by_key(|((surface, reason), _)| (*surface, *reason));
    for ((surface, reason), value) in rate_entries {
        let _ = writeln!(
            output,
            "hearth_rate_limit_hits_total{{surface=\"{surface}\",reason=\"{reason}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP hearth_ws_disconnects_total Count of websocket disconnect events by reason\n",
    );
    output.push_str("# TYPE hearth_ws_disconnects_total counter\n");
    let mut ws_entries: Vec<_> = ws_disconnects.into_iter().collect();
    ws_entries.sort_by_key(|(reason, _)| *reason);
    for (reason, value) in ws_entries {
        let _ = writeln!(
            output,
            "hearth_ws_disconnects_total{{reason=\"{reason}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP hearth_gateway_events_emitted_total Count of emitted gateway events by scope and op\n",
    );
    output.push_str("# TYPE hearth_gateway_events_emitted_total counter\n");
    let mut emitted_entries: Vec<_> = gateway_events_emitted.into_iter().collect();
    emitted_entries.sort_by(|((a_scope, a_op), _), ((b_scope, b_op), _)| {
        a_scope.cmp(b_scope).then(a_op.cmp(b_op))
    });
    for ((scope, op), value) in emitted_entries {
        let _ = writeln!(
            output,
            "hearth_gateway_events_emitted_total{{scope=\"{scope}\",op=\"{op}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP hearth_gateway_events_dropped_total Count of dropped gateway events by scope, op, and reason\n",
    );
    output.push_str("# TYPE hearth_gateway_events_dropped_total counter\n");
    let mut dropped_entries: Vec<_> = gateway_events_dropped.into_iter().collect();
    dropped_entries.sort_by(
        |((a_scope, a_op, a_reason), _), ((b_scope, b_op, b_reason), _)| {
            a_scope
                .cmp(b_scope)
                .then(a_op.cmp(b_op))
                .then(a_reason.cmp(b_reason))
        },
    );
    for ((scope, op, reason), value) in dropped_entries {
        let _ = writeln!(
            output,
            "hearth_gateway_events_dropped_total{{scope=\"{scope}\",op=\"{op}\",reason=\"{reason}\"}} {value}"
        );
    }

    output
}
