//! Structured logging macros shared by handlers, services and the store.
//!
//! Field names (`operation`, `card_id`, `file_id`, `user_id`, `service`,
//! `component`) stay the same everywhere so log queries work across layers.
//! Each expansion calls `tracing` by path.

// ============================================================================
// API Operation Logging Macros
// ============================================================================

/// Log the start of an API operation with consistent fields
#[macro_export]
macro_rules! log_api_start {
    ($operation:expr, card_id = $card_id:expr) => {
        tracing::debug!(
            operation = $operation,
            card_id = %$card_id,
            "API operation started"
        );
    };
    ($operation:expr, file_id = $file_id:expr) => {
        tracing::debug!(
            operation = $operation,
            file_id = %$file_id,
            "API operation started"
        );
    };
    ($operation:expr, user_id = $user_id:expr) => {
        tracing::debug!(
            operation = $operation,
            user_id = %$user_id,
            "API operation started"
        );
    };
    ($operation:expr) => {
        tracing::debug!(
            operation = $operation,
            "API operation started"
        );
    };
}

/// Log successful completion of an API operation
#[macro_export]
macro_rules! log_api_success {
    ($operation:expr, card_id = $card_id:expr, $msg:expr) => {
        tracing::info!(
            operation = $operation,
            card_id = %$card_id,
            "API operation completed: {}", $msg
        );
    };
    ($operation:expr, file_id = $file_id:expr, $msg:expr) => {
        tracing::info!(
            operation = $operation,
            file_id = %$file_id,
            "API operation completed: {}", $msg
        );
    };
    ($operation:expr, count = $count:expr, $msg:expr) => {
        tracing::info!(
            operation = $operation,
            count = $count,
            "API operation completed: {}", $msg
        );
    };
    ($operation:expr, $msg:expr) => {
        tracing::info!(
            operation = $operation,
            "API operation completed: {}", $msg
        );
    };
}

/// Log API warnings with context
#[macro_export]
macro_rules! log_api_warn {
    ($operation:expr, user_id = $user_id:expr, $msg:expr) => {
        tracing::warn!(
            operation = $operation,
            user_id = %$user_id,
            "API operation warning: {}", $msg
        );
    };
    ($operation:expr, $msg:expr) => {
        tracing::warn!(
            operation = $operation,
            "API operation warning: {}", $msg
        );
    };
}

// ============================================================================
// Service Layer Logging Macros
// ============================================================================

/// Log service operation start with context
#[macro_export]
macro_rules! log_service_start {
    ($service:expr, $operation:expr, card_id = $card_id:expr) => {
        tracing::info!(
            service = $service,
            operation = $operation,
            card_id = %$card_id,
            "Service operation started"
        );
    };
    ($service:expr, $operation:expr) => {
        tracing::info!(
            service = $service,
            operation = $operation,
            "Service operation started"
        );
    };
}

/// Log service operation success
#[macro_export]
macro_rules! log_service_success {
    ($service:expr, $operation:expr, card_id = $card_id:expr, duration_ms = $duration:expr) => {
        tracing::info!(
            service = $service,
            operation = $operation,
            card_id = %$card_id,
            duration_ms = $duration,
            "Service operation completed successfully"
        );
    };
    ($service:expr, $operation:expr, $msg:expr) => {
        tracing::info!(
            service = $service,
            operation = $operation,
            "Service operation completed: {}", $msg
        );
    };
}

/// Log service operation errors
#[macro_export]
macro_rules! log_service_error {
    ($service:expr, $operation:expr, error = $error:expr) => {
        tracing::error!(
            service = $service,
            operation = $operation,
            error = %$error,
            "Service operation failed"
        );
    };
}

/// Log service warnings
#[macro_export]
macro_rules! log_service_warn {
    ($service:expr, $operation:expr, $msg:expr) => {
        tracing::warn!(
            service = $service,
            operation = $operation,
            "Service warning: {}",
            $msg
        );
    };
}

// ============================================================================
// Database Operation Logging Macros
// ============================================================================

/// Log database operation performance and results
#[macro_export]
macro_rules! log_db_operation {
    (debug, $operation:expr, count = $count:expr, duration_ms = $duration:expr) => {
        tracing::debug!(
            component = "database",
            operation = $operation,
            result_count = $count,
            duration_ms = $duration,
            "Database operation completed"
        );
    };
    (info, $operation:expr, $msg:expr) => {
        tracing::info!(
            component = "database",
            operation = $operation,
            "Database operation: {}", $msg
        );
    };
}

// ============================================================================
// System Event Logging Macros
// ============================================================================

/// Log system startup and shutdown events
#[macro_export]
macro_rules! log_system_event {
    (startup, component = $component:expr, $msg:expr) => {
        tracing::info!(
            event_type = "startup",
            component = $component,
            "System event: {}",
            $msg
        );
    };
    (shutdown, component = $component:expr, $msg:expr) => {
        tracing::info!(
            event_type = "shutdown",
            component = $component,
            "System event: {}",
            $msg
        );
    };
    (config, $msg:expr) => {
        tracing::info!(event_type = "configuration", "System event: {}", $msg);
    };
}

// ============================================================================
// Validation Logging Macros
// ============================================================================

/// Log validation results consistently
#[macro_export]
macro_rules! log_validation {
    (success, $component:expr, $msg:expr) => {
        tracing::debug!(
            event_type = "validation",
            component = $component,
            result = "success",
            "Validation completed: {}", $msg
        );
    };
    (failure, $component:expr, error = $error:expr) => {
        tracing::warn!(
            event_type = "validation",
            component = $component,
            result = "failure",
            error = %$error,
            "Validation failed"
        );
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_logging_macros_compile() {
        let card_pk: i64 = 42;
        let error = anyhow::anyhow!("test error");

        log_api_start!("test_operation", card_id = card_pk);
        log_api_start!("test_operation", file_id = 7);
        log_api_start!("test_operation", user_id = 1);
        log_api_start!("test_operation");

        log_api_success!("test_operation", card_id = card_pk, "operation completed");
        log_api_success!("test_operation", file_id = 7, "file stored");
        log_api_success!("test_operation", count = 5, "cards listed");
        log_api_success!("test_operation", "done");

        log_api_warn!("test_operation", user_id = 1, "operation warning");
        log_api_warn!("test_operation", "operation warning");

        log_service_start!("card_service", "create_card", card_id = "1a");
        log_service_start!("file_service", "upload");
        log_service_success!("card_service", "create_card", card_id = "1a", duration_ms = 3);
        log_service_success!("card_service", "create_card", "card created successfully");
        log_service_error!("file_service", "upload", error = error);
        log_service_warn!("file_service", "upload", "blob cleanup skipped");

        log_db_operation!(debug, "search_cards", count = 3, duration_ms = 10);
        log_db_operation!(info, "migration", "database initialized");

        log_system_event!(startup, component = "server", "server starting");
        log_system_event!(shutdown, component = "server", "server stopped");
        log_system_event!(config, "configuration loaded successfully");

        log_validation!(success, "api_request", "request validated");
        log_validation!(failure, "configuration", error = "bad port");
    }
}
