use std::collections::VecDeque;

/// Byte-capped buffer of appended output chunks.
///
/// Oldest chunks are dropped to stay under the cap, but the most recent
/// chunk is always retained even when it alone exceeds the cap, so a
/// single oversized write never yields an empty buffer.
#[derive(Debug)]
pub struct LogBuffer {
    chunks: VecDeque<String>,
    total_bytes: usize,
    max_bytes: usize,
}

impl LogBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            max_bytes,
        }
    }

    pub fn append(&mut self, chunk: impl Into<String>) {
        let chunk = chunk.into();
        self.total_bytes += chunk.len();
        self.chunks.push_back(chunk);

        while self.total_bytes > self.max_bytes && self.chunks.len() > 1 {
            if let Some(dropped) = self.chunks.pop_front() {
                self.total_bytes -= dropped.len();
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// All retained chunks, in append order.
    pub fn contents(&self) -> String {
        self.chunks.iter().flat_map(|c| c.chars()).collect()
    }

    /// The last `n` bytes of the retained output, on a char boundary.
    pub fn tail(&self, n: usize) -> String {
        let all = self.contents();
        if all.len() <= n {
            return all;
        }
        let mut start = all.len() - n;
        while !all.is_char_boundary(start) {
            start += 1;
        }
        all[start..].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retains_everything_under_cap() {
        let mut buf = LogBuffer::new(100);
        buf.append("hello ");
        buf.append("world");
        assert_eq!(buf.contents(), "hello world");
        assert_eq!(buf.total_bytes(), 11);
    }

    #[test]
    fn drops_oldest_chunks_beyond_cap() {
        let mut buf = LogBuffer::new(10);
        buf.append("aaaa");
        buf.append("bbbb");
        buf.append("cccc");
        // "aaaa" must be gone, order of the rest preserved
        assert_eq!(buf.contents(), "bbbbcccc");
        assert!(buf.total_bytes() <= 10);
    }

    #[test]
    fn bound_holds_for_any_append_sequence() {
        let mut buf = LogBuffer::new(64);
        for i in 0..1000 {
            let chunk = "x".repeat(i % 37 + 1);
            let last_len = chunk.len();
            buf.append(chunk);
            assert!(buf.total_bytes() <= 64 + last_len);
        }
    }

    #[test]
    fn keeps_a_single_oversized_chunk() {
        let mut buf = LogBuffer::new(8);
        buf.append("this chunk is far larger than the cap");
        assert_eq!(buf.contents(), "this chunk is far larger than the cap");
    }

    #[test]
    fn tail_returns_last_bytes() {
        let mut buf = LogBuffer::new(1024);
        buf.append("error: something broke\n");
        buf.append("stack line 1\n");
        assert_eq!(buf.tail(7), "line 1\n");
        assert_eq!(buf.tail(10_000), buf.contents());
    }
}
