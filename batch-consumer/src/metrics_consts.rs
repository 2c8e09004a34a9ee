// ==== Item source metrics ====
/// Counter for items read from the source and forwarded to the windower
pub const ITEMS_RECEIVED: &str = "batch_consumer_items_received_total";

/// Counter for source errors, labelled by `kind`
pub const SOURCE_ERRORS: &str = "batch_consumer_source_errors_total";

// ==== Windower metrics ====
/// Counter for flushed batches, labelled by `trigger` (size, timeout, drain)
pub const BATCH_FLUSHES: &str = "batch_consumer_flushes_total";

/// Histogram for the number of items in each flushed batch
pub const BATCH_SIZE: &str = "batch_consumer_batch_size";

// ==== Handler metrics ====
/// Histogram for handler invocation time
pub const HANDLER_DURATION: &str = "batch_consumer_handler_duration_seconds";

/// Counter for handler invocations that returned an error
pub const HANDLER_ERRORS: &str = "batch_consumer_handler_errors_total";

/// Counter for offsets that could not be stored after a batch was handled
pub const OFFSET_STORE_ERRORS: &str = "batch_consumer_offset_store_errors_total";
