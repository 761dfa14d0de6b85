//! Architecture support.

pub mod x86_64;

pub use self::x86_64::{disable_interrupts, enable_interrupts, halt, interrupts_enabled};
