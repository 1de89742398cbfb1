mod panic_hook;

pub use panic_hook::{panic_message, tracing_panic_hook};
