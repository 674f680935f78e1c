//! Core abstractions for talking to a GDB/LLDB Machine Interface backend.
//!
//! This crate provides the fundamental building blocks:
//! - `Value`, `Tuple`, `List` - Ordered MI value tree with typed accessors
//! - `Record` - Classified output line (result, async, stream, prompt)
//! - `parse_record` - Single-pass MI line parser
//! - `LaunchConfig` - How to reach the backend
//! - `Transport` trait and `TransportEvent`

pub mod config;
pub mod error;
pub mod parser;
pub mod record;
pub mod traits;
pub mod value;

pub use config::{Arguments, ConfigError, ConnectionKind, EnvironmentEntry, LaunchConfig};
pub use error::{FieldAccessError, ParseError};
pub use parser::{parse_c_string, parse_record, parse_result_list};
pub use record::{AsyncRecord, Record, ResultClass, ResultRecord, UnknownResultClass};
pub use traits::{Connection, Transport, TransportError, TransportEvent};
pub use value::{List, NamedValue, Tuple, Value, escape};
