pub const MESSAGES_PRODUCED: &str = "kafka_connector_messages_produced_total";
pub const PRODUCE_FAILURES: &str = "kafka_connector_produce_failures_total";
pub const MESSAGES_RECEIVED: &str = "kafka_connector_messages_received_total";
pub const MESSAGES_HANDLED: &str = "kafka_connector_messages_handled_total";
pub const HANDLER_FAILURES: &str = "kafka_connector_handler_failures_total";
pub const HANDLER_RETRIES: &str = "kafka_connector_handler_retries_total";
pub const MESSAGES_SKIPPED: &str = "kafka_connector_messages_skipped_total";
pub const DECODE_FAILURES: &str = "kafka_connector_decode_failures_total";
