use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

/// Outcome label for a chat socket handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Accepted,
    AuthFailed,
    NotParticipant,
    Error,
}

impl HandshakeOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::AuthFailed => "auth_failed",
            Self::NotParticipant => "not_participant",
            Self::Error => "error",
        }
    }
}

const HANDSHAKE_OUTCOMES: [HandshakeOutcome; 4] = [
    HandshakeOutcome::Accepted,
    HandshakeOutcome::AuthFailed,
    HandshakeOutcome::NotParticipant,
    HandshakeOutcome::Error,
];

pub struct GatewayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_handshakes_total: Mutex<HashMap<String, u64>>,
    ws_active_sessions: AtomicI64,
    messages_persisted_total: Mutex<HashMap<String, u64>>,
    messages_deleted_total: AtomicU64,
    broadcast_deliveries_total: AtomicU64,
    broadcast_dropped_total: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<Arc<GatewayMetrics>> = OnceLock::new();

impl Default for GatewayMetrics {
    fn default() -> Self {
        let mut ws_handshakes_total = HashMap::new();
        for outcome in HANDSHAKE_OUTCOMES {
            ws_handshakes_total.insert(outcome.as_str().to_string(), 0);
        }

        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            ws_handshakes_total: Mutex::new(ws_handshakes_total),
            ws_active_sessions: AtomicI64::new(0),
            messages_persisted_total: Mutex::new(HashMap::new()),
            messages_deleted_total: AtomicU64::new(0),
            broadcast_deliveries_total: AtomicU64::new(0),
            broadcast_dropped_total: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<GatewayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<GatewayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_ws_handshake(outcome: HandshakeOutcome) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_handshake(outcome);
    }
}

pub fn session_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.ws_active_sessions.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn session_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.ws_active_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn record_message_persisted(source: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_message_persisted(source);
    }
}

pub fn record_message_deleted() {
    if let Some(metrics) = global_metrics() {
        metrics.messages_deleted_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn record_broadcast(delivered: usize, dropped: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.record_broadcast(delivered, dropped);
    }
}

impl GatewayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_handshake(&self, outcome: HandshakeOutcome) {
        increment_label_counter(&self.ws_handshakes_total, outcome.as_str(), 1);
    }

    pub fn record_message_persisted(&self, source: &str) {
        let label = source.trim().to_ascii_lowercase();
        let label = if label.is_empty() { "unknown".to_string() } else { label };
        increment_label_counter(&self.messages_persisted_total, &label, 1);
    }

    pub fn record_broadcast(&self, delivered: usize, dropped: usize) {
        self.broadcast_deliveries_total.fetch_add(delivered as u64, Ordering::SeqCst);
        self.broadcast_dropped_total.fetch_add(dropped as u64, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP gateway_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE gateway_request_rate_total counter\n");
        append_counter_lines(&mut output, "gateway_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP gateway_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE gateway_request_errors_total counter\n");
        append_counter_lines(
            &mut output,
            "gateway_request_errors_total",
            &self.request_errors_total,
        );

        output.push_str("# HELP gateway_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE gateway_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "gateway_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP gateway_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE gateway_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "gateway_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP chat_ws_handshakes_total Chat socket handshakes by outcome.\n");
        output.push_str("# TYPE chat_ws_handshakes_total counter\n");
        append_label_counter_lines(
            &mut output,
            "chat_ws_handshakes_total",
            "outcome",
            &self.ws_handshakes_total,
        );

        output.push_str("# HELP chat_ws_active_sessions Chat sockets currently joined.\n");
        output.push_str("# TYPE chat_ws_active_sessions gauge\n");
        output.push_str(&format!(
            "chat_ws_active_sessions {}\n",
            self.ws_active_sessions.load(Ordering::SeqCst).max(0)
        ));

        output.push_str("# HELP chat_messages_persisted_total Messages persisted by source.\n");
        output.push_str("# TYPE chat_messages_persisted_total counter\n");
        append_label_counter_lines(
            &mut output,
            "chat_messages_persisted_total",
            "source",
            &self.messages_persisted_total,
        );

        output.push_str("# HELP chat_messages_deleted_total Messages deleted by their sender.\n");
        output.push_str("# TYPE chat_messages_deleted_total counter\n");
        output.push_str(&format!(
            "chat_messages_deleted_total {}\n",
            self.messages_deleted_total.load(Ordering::SeqCst)
        ));

        output.push_str(
            "# HELP chat_broadcast_deliveries_total Events handed to session outboxes.\n",
        );
        output.push_str("# TYPE chat_broadcast_deliveries_total counter\n");
        output.push_str(&format!(
            "chat_broadcast_deliveries_total {}\n",
            self.broadcast_deliveries_total.load(Ordering::SeqCst)
        ));

        output.push_str(
            "# HELP chat_broadcast_dropped_total Events dropped because a session had already closed.\n",
        );
        output.push_str("# TYPE chat_broadcast_dropped_total counter\n");
        output.push_str(&format!(
            "chat_broadcast_dropped_total {}\n",
            self.broadcast_dropped_total.load(Ordering::SeqCst)
        ));

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if segment.chars().all(|character| character.is_ascii_digit()) {
            normalized_segments.push("{number}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = lock(map);
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = lock(map);
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
