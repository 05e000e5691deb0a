use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::PathBuf,
    sync::Arc,
};

use parking_lot::Mutex;

/// Removes ANSI colour sequences so the log file stays plain text.
pub fn strip_ansi_escapes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        for next in chars.by_ref() {
            if next.is_ascii_alphabetic() {
                break;
            }
        }
    }
    out
}

/// Append-only log file holding at most `max_lines` lines.
///
/// Lines are counted as they are written; once the file grows past the bound by
/// a slack of `max(max_lines / 10, 50)` lines it is rewritten with the newest
/// `max_lines` lines only.
#[derive(Clone)]
pub struct BoundedLogFile {
    inner: Arc<Mutex<LogFileState>>,
}

struct LogFileState {
    path: PathBuf,
    file: Option<File>,
    max_lines: usize,
    lines: usize,
}

impl BoundedLogFile {
    pub fn open(path: impl Into<PathBuf>, max_lines: usize) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let lines = fs::read(&path)
            .map(|bytes| bytes.iter().filter(|&&b| b == b'\n').count())
            .unwrap_or(0);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            inner: Arc::new(Mutex::new(LogFileState {
                path,
                file: Some(file),
                max_lines: max_lines.max(1),
                lines,
            })),
        })
    }
}

impl LogFileState {
    fn slack(&self) -> usize {
        (self.max_lines / 10).max(50)
    }

    fn truncate_to_tail(&mut self) -> io::Result<()> {
        // Release the append handle before rewriting.
        self.file = None;

        let content = fs::read_to_string(&self.path)?;
        let total = content.lines().count();
        let skip = total.saturating_sub(self.max_lines);
        let mut kept = String::with_capacity(content.len());
        for line in content.lines().skip(skip) {
            kept.push_str(line);
            kept.push('\n');
        }
        fs::write(&self.path, kept)?;

        self.lines = total - skip;
        self.file = Some(OpenOptions::new().append(true).open(&self.path)?);
        Ok(())
    }
}

impl Write for BoundedLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.inner.lock();
        match state.file.as_mut() {
            Some(file) => file.write_all(buf)?,
            None => return Err(io::Error::other("log file is closed")),
        }

        state.lines += buf.iter().filter(|&&b| b == b'\n').count();
        if state.lines > state.max_lines + state.slack() {
            if let Err(e) = state.truncate_to_tail() {
                eprintln!("failed to prune log file: {e}");
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.lock().file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for BoundedLogFile {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
