// Process exit codes

pub const SUCCESS: i32 = 0;
pub const EXECUTION_ERROR: i32 = 1;
pub const INPUT_ERROR: i32 = 2;
/// The transport could not be reached or failed for good
pub const CONNECTION_ERROR: i32 = 3;
/// Some messages parsed, some did not
pub const PARTIAL_FAILURE: i32 = 4;
