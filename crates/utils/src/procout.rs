use std::sync::RwLock;

/// Which pipe a chunk of process output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

/// Cumulative output of one supervised process.
///
/// Both buffers are append-only: writers only ever push to the end, so a
/// reader can remember a byte offset and later fetch everything written
/// since. Readers always get an owned copy, never a reference into the
/// buffer.
#[derive(Default)]
pub struct ProcOutput {
    stdout: RwLock<String>,
    stderr: RwLock<String>,
}

impl ProcOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, source: OutputSource, chunk: &str) {
        let buf = match source {
            OutputSource::Stdout => &self.stdout,
            OutputSource::Stderr => &self.stderr,
        };
        buf.write().unwrap().push_str(chunk);
    }

    pub fn stdout_snapshot(&self) -> String {
        self.stdout.read().unwrap().clone()
    }

    pub fn stderr_snapshot(&self) -> String {
        self.stderr.read().unwrap().clone()
    }

    /// Everything appended to `source` since `offset`, plus the new offset.
    ///
    /// Offsets are byte positions; chunks are pushed whole, so an offset
    /// returned here always lands on a chunk boundary.
    pub fn since(&self, source: OutputSource, offset: usize) -> (String, usize) {
        let buf = match source {
            OutputSource::Stdout => &self.stdout,
            OutputSource::Stderr => &self.stderr,
        };
        let guard = buf.read().unwrap();
        if offset >= guard.len() {
            return (String::new(), guard.len());
        }
        (guard[offset..].to_string(), guard.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_returns_only_new_content() {
        let out = ProcOutput::new();
        out.push(OutputSource::Stdout, "hello ");
        let (chunk, offset) = out.since(OutputSource::Stdout, 0);
        assert_eq!(chunk, "hello ");

        out.push(OutputSource::Stdout, "world");
        let (chunk, offset) = out.since(OutputSource::Stdout, offset);
        assert_eq!(chunk, "world");

        let (chunk, _) = out.since(OutputSource::Stdout, offset);
        assert!(chunk.is_empty());
    }

    #[test]
    fn streams_are_independent() {
        let out = ProcOutput::new();
        out.push(OutputSource::Stdout, "out");
        out.push(OutputSource::Stderr, "err");
        assert_eq!(out.stdout_snapshot(), "out");
        assert_eq!(out.stderr_snapshot(), "err");
    }
}
