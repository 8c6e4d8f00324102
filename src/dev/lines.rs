/// Splits a byte stream into complete lines; a trailing fragment waits for its newline.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append `chunk` and return the last complete, non-empty line it finished, if any.
    pub fn push(&mut self, chunk: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(chunk);
        let end = self.pending.iter().rposition(|&b| b == b'\n')?;
        let complete: Vec<u8> = self.pending.drain(..=end).collect();
        complete
            .split(|&b| b == b'\n')
            .map(|line| String::from_utf8_lossy(line).trim().to_owned())
            .rfind(|line| !line.is_empty())
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
