use std::fs::{File, OpenOptions};
use std::io::{self, Stdout, Write};
use std::path::Path;

use anyhow::{anyhow, Result};
use slog::{o, Drain};

use crate::conf::logging::{Log, To};

pub use slog::Logger;
pub use slog_async::AsyncGuard;

/// Installs the slog backend behind the `log` facade.
///
/// The returned guard flushes the async drain when dropped, keep it alive until exit.
pub fn logger_init(cfg: &Log) -> Result<Option<AsyncGuard>> {
    if cfg.to.off() {
        log::set_max_level(log::LevelFilter::Off);
        return Ok(None);
    }

    let (logger, guard) = config_logger(cfg)?;
    log::set_boxed_logger(Box::new(LoggerEx(logger))).map_err(|e| anyhow!("logger init error, {e}"))?;
    log::set_max_level(slog_log_to_level(cfg.level.inner()).to_level_filter());
    Ok(Some(guard))
}

struct LoggerEx(Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());
        let args = r.args();
        let target = r.target();
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: target };

        self.0.log(&slog::Record::new(&s, args, slog::b!()))
    }

    fn flush(&self) {}
}

fn log_to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

fn slog_log_to_level(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error => log::Level::Error,
        slog::Level::Critical => log::Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();

    slog::RecordLocation { file, line, column: 0, function: "", module }
}

pub fn config_logger(cfg: &Log) -> Result<(Logger, AsyncGuard)> {
    let writer = WriteFilter::new(cfg.to, &cfg.filename())?;
    let decorator = slog_term::PlainDecorator::new(writer);
    let drain = slog_term::FullFormat::new(decorator)
        .use_custom_timestamp(|io: &mut dyn io::Write| {
            write!(io, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        })
        .build()
        .fuse();

    let drain = slog::LevelFilter::new(drain, cfg.level.inner()).fuse();

    let (drain, guard) = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build_with_guard();

    Ok((slog::Logger::root(drain.fuse(), o!()), guard))
}

struct WriteFilter {
    to: To,
    file: Option<File>,
    console: Stdout,
}

impl WriteFilter {
    fn new(to: To, filename: &str) -> Result<Self> {
        let file = if to.file() { Some(open_file(filename)?) } else { None };
        Ok(Self { to, file, console: io::stdout() })
    }
}

impl io::Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.to.console() {
            self.console.write_all(buf)?;
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.to.console() {
            self.console.flush()?;
        }
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

fn open_file(filename: &str) -> Result<File> {
    if filename.is_empty() {
        return Err(anyhow!("logger file config error, filename is empty"));
    }
    if let Some(dir) = Path::new(filename).parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow!("logger dir config error, dir: {}, {:?}", dir.display(), e))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(filename)
        .map_err(|e| anyhow!("logger file config error, filename: {}, {:?}", filename, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_conversion() {
        assert_eq!(log_to_slog_level(log::Level::Warn), slog::Level::Warning);
        assert_eq!(slog_log_to_level(slog::Level::Critical), log::Level::Error);
    }

    #[test]
    fn test_file_logger() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Log {
            to: To::File,
            dir: dir.path().join("nested").to_string_lossy().into_owned(),
            ..Default::default()
        };
        let (logger, guard) = config_logger(&cfg).unwrap();
        slog::info!(logger, "hello file");
        drop(logger);
        drop(guard);
        let text = std::fs::read_to_string(cfg.filename()).unwrap();
        assert!(text.contains("hello file"));
    }
}
