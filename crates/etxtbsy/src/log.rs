use crate::config::LogLevel;
use slog::{o, Drain, Key, LevelFilter, Logger, Never, OwnedKVList, Record, Serializer, KV as _};
use slog_term::{FullFormat, PlainSyncDecorator, TermDecorator, TestStdoutWriter};
use std::{
    fmt::{self, Write as _},
    sync::{Arc, Mutex, PoisonError},
};

/// Build the root logger and hand it to `f`.
///
/// The drain is synchronous. Workers terminate the process with `process::exit` as soon as they
/// log a fatal error, so nothing may be left sitting in a queue.
pub fn run_with_logger<T>(log_level: LogLevel, f: impl FnOnce(Logger) -> T) -> T {
    let decorator = TermDecorator::new().stderr().build();
    let drain = FullFormat::new(decorator).build();
    let drain = Mutex::new(drain).fuse();
    let drain = LevelFilter::new(drain, log_level.as_slog_level()).fuse();
    let log = Logger::root(drain, o!());
    f(log)
}

pub fn test_logger() -> Logger {
    let decorator = PlainSyncDecorator::new(TestStdoutWriter);
    let drain = FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}

/// A drain that remembers every record as `"<level> <message> <key>=<value>..."`. The record's
/// own key-values come first, followed by the logger's.
#[derive(Clone, Default)]
pub struct CapturingDrain(Arc<Mutex<Vec<String>>>);

impl CapturingDrain {
    pub fn logger(&self) -> Logger {
        Logger::root(self.clone(), o!())
    }

    pub fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

struct LineSerializer<'a>(&'a mut String);

impl Serializer for LineSerializer<'_> {
    fn emit_arguments(&mut self, key: Key, val: &fmt::Arguments) -> slog::Result {
        write!(self.0, " {key}={val}")?;
        Ok(())
    }
}

impl Drain for CapturingDrain {
    type Ok = ();
    type Err = Never;

    fn log(&self, record: &Record, values: &OwnedKVList) -> Result<(), Never> {
        let mut line = format!("{} {}", record.level().as_short_str(), record.msg());
        let mut serializer = LineSerializer(&mut line);
        // Writing into a String can't fail.
        let _ = record.kv().serialize(record, &mut serializer);
        let _ = values.serialize(record, &mut serializer);
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
        Ok(())
    }
}
