//! krabtrace - event trace capture, decoding, filtering and process correlation
//!
//! Raw event records flow through a session's enabled sources: filters gate
//! delivery, semantic parsers and the property decoder turn typed fields into
//! structured records, and the process correlator keeps what concerns one
//! monitored process. The OS trace itself sits behind [`backend::TraceBackend`].

pub mod backend;
pub mod buffer;
pub mod cli;
pub mod config;
pub mod correlator;
pub mod decoder;
pub mod dns;
pub mod error;
pub mod extractor;
pub mod filter;
pub mod launch;
pub mod monitor;
pub mod parser;
pub mod provider;
pub mod providers;
pub mod record;
pub mod registry;
pub mod session;
pub mod sink;

pub use error::{Result, TraceError};
pub use filter::{EventFilter, EventHandler, Predicate};
pub use provider::EventSource;
pub use record::{EventRecord, Property, StructuredRecord};
pub use session::{SessionState, TraceSession};
