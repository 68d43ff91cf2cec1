use std::fmt;

/// Longest chunk-size line accepted before the encoding is declared malformed.
const MAX_SIZE_LINE: usize = 1024;

/// Chunked transfer decoding state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkedState {
    /// Reading chunk size line
    ChunkSize,
    /// Reading chunk data
    ChunkData { remaining: usize },
    /// Expecting the CRLF that closes a chunk's data
    ChunkEnd,
    /// Reading trailer lines after the zero-size chunk
    Trailer,
    /// Transfer complete
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkedError {
    /// Size line, chunk terminator or trailer was not well formed
    Malformed(&'static str),
    /// Decoded body grew past the allowed limit
    TooLarge,
}

impl fmt::Display for ChunkedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkedError::Malformed(msg) => write!(f, "malformed chunked body: {}", msg),
            ChunkedError::TooLarge => write!(f, "chunked body exceeds limit"),
        }
    }
}

impl std::error::Error for ChunkedError {}

/// Incremental decoder for `Transfer-Encoding: chunked` bodies.
///
/// The decoder never buffers input of its own: it consumes complete units
/// (a size line, a run of data, a terminator, a trailer line) from the
/// slice it is given and reports how many bytes it used. Whatever is left
/// stays with the caller and is offered again once more bytes arrive.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkedState,
    max_body_size: usize,
    trailer_headers: Vec<(String, String)>,
}

impl ChunkedDecoder {
    pub fn new(max_body_size: usize) -> Self {
        ChunkedDecoder {
            state: ChunkedState::ChunkSize,
            max_body_size,
            trailer_headers: Vec::new(),
        }
    }

    /// Lower the body ceiling once the applicable policy is known.
    pub fn set_limit(&mut self, max_body_size: usize) {
        self.max_body_size = max_body_size;
    }

    /// Decode as much of `data` as possible, appending payload to `body`.
    /// Returns the number of input bytes consumed.
    pub fn decode(&mut self, data: &[u8], body: &mut Vec<u8>) -> Result<usize, ChunkedError> {
        let mut pos = 0;

        loop {
            let input = &data[pos..];
            let used = match self.state {
                ChunkedState::ChunkSize => {
                    let Some(end) = find_crlf(input) else {
                        if input.len() > MAX_SIZE_LINE {
                            return Err(ChunkedError::Malformed("chunk size line too long"));
                        }
                        break;
                    };
                    let size = parse_chunk_size(&input[..end])?;
                    if size > self.max_body_size.saturating_sub(body.len()) {
                        return Err(ChunkedError::TooLarge);
                    }
                    self.state = if size == 0 {
                        ChunkedState::Trailer
                    } else {
                        ChunkedState::ChunkData { remaining: size }
                    };
                    end + 2
                }
                ChunkedState::ChunkData { remaining } => {
                    if input.is_empty() {
                        break;
                    }
                    let take = remaining.min(input.len());
                    body.extend_from_slice(&input[..take]);
                    self.state = if take == remaining {
                        ChunkedState::ChunkEnd
                    } else {
                        ChunkedState::ChunkData { remaining: remaining - take }
                    };
                    take
                }
                ChunkedState::ChunkEnd => {
                    if input.len() < 2 {
                        if input.first().is_some_and(|&b| b != b'\r') {
                            return Err(ChunkedError::Malformed("missing CRLF after chunk data"));
                        }
                        break;
                    }
                    if &input[..2] != b"\r\n" {
                        return Err(ChunkedError::Malformed("missing CRLF after chunk data"));
                    }
                    self.state = ChunkedState::ChunkSize;
                    2
                }
                ChunkedState::Trailer => {
                    let Some(end) = find_crlf(input) else {
                        if input.len() > MAX_SIZE_LINE {
                            return Err(ChunkedError::Malformed("trailer line too long"));
                        }
                        break;
                    };
                    if end == 0 {
                        self.state = ChunkedState::Complete;
                    } else {
                        self.parse_trailer_line(&input[..end])?;
                    }
                    end + 2
                }
                ChunkedState::Complete => break,
            };
            pos += used;
        }

        Ok(pos)
    }

    fn parse_trailer_line(&mut self, line: &[u8]) -> Result<(), ChunkedError> {
        let line = std::str::from_utf8(line)
            .map_err(|_| ChunkedError::Malformed("trailer is not valid UTF-8"))?;
        let (name, value) = line
            .split_once(':')
            .ok_or(ChunkedError::Malformed("trailer without colon"))?;
        self.trailer_headers
            .push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.state == ChunkedState::Complete
    }

    pub fn state(&self) -> ChunkedState {
        self.state
    }

    pub fn trailer_headers(&self) -> &[(String, String)] {
        &self.trailer_headers
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, ChunkedError> {
    let line = std::str::from_utf8(line)
        .map_err(|_| ChunkedError::Malformed("chunk size is not valid UTF-8"))?;
    // Extensions after ';' are ignored
    let digits = line.split(';').next().unwrap_or(line).trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ChunkedError::Malformed("invalid chunk size"));
    }
    usize::from_str_radix(digits, 16).map_err(|_| ChunkedError::Malformed("chunk size overflow"))
}

/// Find CRLF sequence in buffer
pub(crate) fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == b"\r\n")
}
