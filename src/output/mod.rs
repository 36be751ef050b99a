mod response;

pub use response::{exit_code_to_u8, print_error, print_outcome};
