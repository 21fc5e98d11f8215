//! Log messages to a file, optionally tee'd to stdout and timestamped.
//!
//! Used for rsbackup's daemon-mode run log, distinct from the `log` crate
//! facade used for diagnostics: this is the operator-facing record of what
//! a particular invocation did.

use std::io::Write;

use anyhow::Error;
use chrono::Local;

#[derive(Debug, Default)]
pub struct FileLogOptions {
    /// Open in append mode; needed when multiple invocations share a log
    /// file. Atomic only for writes smaller than `PIPE_BUF`.
    pub append: bool,
    pub read: bool,
    /// Fail if the file already exists, rather than reusing it.
    pub exclusive: bool,
    /// Duplicate every logged line to stdout, like `tee`.
    pub to_stdout: bool,
    /// Prefix each line with the current local time as RFC 3339.
    pub prefix_time: bool,
}

#[derive(Debug)]
pub struct FileLogger {
    file: std::fs::File,
    file_name: std::path::PathBuf,
    options: FileLogOptions,
}

/// Logs to a [`FileLogger`] with `format!`-style arguments.
#[macro_export]
macro_rules! flog {
    ($log:expr, $($arg:tt)*) => ({
        $log.log(format!($($arg)*));
    })
}

impl FileLogger {
    pub fn new<P: AsRef<std::path::Path>>(
        file_name: P,
        options: FileLogOptions,
    ) -> Result<Self, Error> {
        let file = Self::open(&file_name, &options)?;
        let file_name = file_name.as_ref().to_path_buf();
        Ok(Self {
            file,
            file_name,
            options,
        })
    }

    pub fn reopen(&mut self) -> Result<&Self, Error> {
        let file = Self::open(&self.file_name, &self.options)?;
        self.file = file;
        Ok(self)
    }

    fn open<P: AsRef<std::path::Path>>(
        file_name: P,
        options: &FileLogOptions,
    ) -> Result<std::fs::File, Error> {
        let file = std::fs::OpenOptions::new()
            .read(options.read)
            .write(true)
            .append(options.append)
            .create_new(options.exclusive)
            .create(!options.exclusive)
            .open(file_name)?;
        Ok(file)
    }

    pub fn log<S: AsRef<str>>(&mut self, msg: S) {
        let msg = msg.as_ref();

        if self.options.to_stdout {
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(msg.as_bytes());
            let _ = stdout.write_all(b"\n");
        }

        let line = if self.options.prefix_time {
            format!("{}: {}\n", Local::now().to_rfc3339(), msg)
        } else {
            format!("{}\n", msg)
        };
        if let Err(err) = self.file.write_all(line.as_bytes()) {
            eprintln!("error writing to log file - {}", err);
        }
    }
}

impl Write for FileLogger {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.options.to_stdout {
            let _ = std::io::stdout().write(buf);
        }
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if self.options.to_stdout {
            let _ = std::io::stdout().flush();
        }
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_lines_with_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let mut logger = FileLogger::new(&path, FileLogOptions::default()).unwrap();
        logger.log("first");
        logger.log("second");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "first\nsecond\n");
    }

    #[test]
    fn exclusive_rejects_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        std::fs::write(&path, b"").unwrap();
        let options = FileLogOptions {
            exclusive: true,
            ..Default::default()
        };
        assert!(FileLogger::new(&path, options).is_err());
    }
}
