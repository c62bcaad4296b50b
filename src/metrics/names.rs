//! Metric names the agent records.

pub const HTTP_DISPATCHER: &str = "HttpDispatcher";
pub const APDEX: &str = "Apdex";
pub const ERRORS_ALL: &str = "Errors/all";
pub const INSTANCE_BUSY: &str = "Instance/Busy";
pub const QUEUE_TIME: &str = "WebFrontend/QueueTime";
pub const QUEUE_LENGTH: &str = "Mongrel/Queue Length";

pub const CONTROLLER_PREFIX: &str = "Controller/";

/// `Controller/<path>`, the metric for one transaction.
pub fn controller(path: &str) -> String {
    format!("{CONTROLLER_PREFIX}{path}")
}

/// `ControllerCPU/<path>`, CPU seconds the transaction used.
pub fn controller_cpu(path: &str) -> String {
    format!("ControllerCPU/{path}")
}

/// `Apdex/<path>`.
pub fn apdex(path: &str) -> String {
    format!("{APDEX}/{path}")
}

/// `Errors/Controller/<path>`.
pub fn errors(path: &str) -> String {
    format!("Errors/{CONTROLLER_PREFIX}{path}")
}
