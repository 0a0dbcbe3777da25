mod e2e;
mod source_errors;
mod utils;
