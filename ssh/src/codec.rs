//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// One unit of client input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Printable text line, without its line terminator
    Line(String),
    /// Bytes that are not a printable text line (packets, scanners, overlong input)
    Binary(Bytes),
}

/// One unit of server output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Text followed by CRLF
    Line(String),
    /// Text without a terminator (prompts)
    Prompt(String),
}

/// Line-oriented codec for the fake SSH dialogue
///
/// Input is split on `\n` with an optional preceding `\r` removed. A line that
/// is not valid UTF-8 or carries control characters other than tab is passed
/// up as [`Input::Binary`] so that packet-level probes are captured rather
/// than mistaken for usernames. Input that reaches `max_length` bytes without
/// a terminator is flushed as [`Input::Binary`] too, which bounds memory.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    /// Bytes of the buffer already scanned for a terminator
    next_index: usize,
}

impl LineCodec {
    /// Create a codec that never buffers more than `max_length` bytes
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
            next_index: 0,
        }
    }

    /// Configured maximum line length
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(1024)
    }
}

fn classify(mut raw: BytesMut) -> Input {
    if raw.last() == Some(&b'\r') {
        raw.truncate(raw.len() - 1);
    }
    let printable = raw
        .iter()
        .all(|&b| b == b'\t' || !(b < 0x20 || b == 0x7f));
    match std::str::from_utf8(&raw) {
        Ok(text) if printable => Input::Line(text.to_string()),
        _ => Input::Binary(raw.freeze()),
    }
}

impl Decoder for LineCodec {
    type Item = Input;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Input>, Self::Error> {
        let scan_end = src.len().min(self.max_length);
        let found = src[self.next_index..scan_end]
            .iter()
            .position(|&b| b == b'\n')
            .map(|offset| self.next_index + offset);

        match found {
            Some(index) => {
                self.next_index = 0;
                let mut line = src.split_to(index + 1);
                line.truncate(index);
                Ok(Some(classify(line)))
            }
            None if src.len() >= self.max_length => {
                self.next_index = 0;
                Ok(Some(Input::Binary(src.split_to(self.max_length).freeze())))
            }
            None => {
                self.next_index = scan_end;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Input>, Self::Error> {
        if let Some(input) = self.decode(src)? {
            return Ok(Some(input));
        }
        self.next_index = 0;
        if src.is_empty() {
            Ok(None)
        } else {
            let rest = src.split_to(src.len());
            Ok(Some(classify(rest)))
        }
    }
}

impl Encoder<Output> for LineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Output, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Output::Line(text) => {
                dst.reserve(text.len() + 2);
                dst.put_slice(text.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Output::Prompt(text) => {
                dst.put_slice(text.as_bytes());
            }
        }
        Ok(())
    }
}
