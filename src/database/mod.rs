//! Database Module - lokales Anrufprotokoll
//!
//! Dieses Modul verwaltet:
//! - die SQLite-Tabelle mit abgeschlossenen Anrufen
//! - den Recorder, der sie aus den Call-State-Events füllt
//!

mod call_log;
mod recorder;

pub use call_log::{CallLog, CallLogEntry, CallLogError};
pub use recorder::CallLogRecorder;
