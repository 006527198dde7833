//! Streaming decoders for `application/x-www-form-urlencoded` and
//! `multipart/form-data` bodies.
//!
//! Both decoders are fed body chunks of any size and report fields to a
//! [`FormSink`] as soon as they are complete. File parts are never buffered
//! whole: their bytes go to the sink as they arrive.

use crate::{
    errors::ErrorKind,
    http::{cursor::BodyStream, types},
};
use memchr::memmem;

/// Description of one uploaded file part.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileData {
    /// `filename` from `Content-Disposition`
    pub file_name: String,
    /// `name` from `Content-Disposition`
    pub param_name: String,
    /// `Content-Type` of the part (default `text/plain`)
    pub mime_type: String,
}

pub(crate) trait FormSink {
    fn field(&mut self, name: String, value: String) -> Result<(), ErrorKind>;
    fn file_begin(&mut self, file: FileData) -> Result<(), ErrorKind>;
    fn file_chunk(&mut self, chunk: &[u8]) -> Result<(), ErrorKind>;
    fn file_end(&mut self) -> Result<(), ErrorKind>;
}

#[inline]
fn utf8(bytes: Vec<u8>) -> Result<String, ErrorKind> {
    String::from_utf8(bytes).map_err(|_| ErrorKind::BodyParse("form field is not valid UTF-8".into()))
}

// URLENCODED

#[derive(Debug, Clone, Copy, PartialEq)]
enum Percent {
    None,
    Opened,
    High(u8),
}

pub(crate) struct UrlEncoded {
    key: Vec<u8>,
    value: Vec<u8>,
    in_value: bool,
    percent: Percent,
    limit: usize,
}

impl UrlEncoded {
    #[inline]
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            key: Vec::new(),
            value: Vec::new(),
            in_value: false,
            percent: Percent::None,
            limit,
        }
    }

    pub(crate) fn feed<S: FormSink>(&mut self, chunk: &[u8], sink: &mut S) -> Result<(), ErrorKind> {
        for &byte in chunk {
            self.push(byte, sink)?;
        }
        Ok(())
    }

    pub(crate) fn finish<S: FormSink>(mut self, sink: &mut S) -> Result<(), ErrorKind> {
        self.flush_percent()?;
        self.flush_pair(sink)
    }

    fn push<S: FormSink>(&mut self, byte: u8, sink: &mut S) -> Result<(), ErrorKind> {
        match self.percent {
            Percent::Opened => match types::hex_value(byte) {
                Some(_) => {
                    self.percent = Percent::High(byte);
                    return Ok(());
                }
                None => self.flush_percent()?,
            },
            Percent::High(high) => {
                if let (Some(hi), Some(lo)) = (types::hex_value(high), types::hex_value(byte)) {
                    self.percent = Percent::None;
                    return self.emit(hi << 4 | lo);
                }
                self.flush_percent()?;
            }
            Percent::None => {}
        }

        match byte {
            b'%' => self.percent = Percent::Opened,
            b'&' => self.flush_pair(sink)?,
            b'=' if !self.in_value => self.in_value = true,
            b'+' => self.emit(b' ')?,
            _ => self.emit(byte)?,
        }
        Ok(())
    }

    // An unfinished `%X` is kept as written
    fn flush_percent(&mut self) -> Result<(), ErrorKind> {
        match std::mem::replace(&mut self.percent, Percent::None) {
            Percent::None => Ok(()),
            Percent::Opened => self.emit(b'%'),
            Percent::High(high) => {
                self.emit(b'%')?;
                self.emit(high)
            }
        }
    }

    #[inline]
    fn emit(&mut self, byte: u8) -> Result<(), ErrorKind> {
        let target = match self.in_value {
            true => &mut self.value,
            false => &mut self.key,
        };

        if target.len() >= self.limit {
            return Err(ErrorKind::BodySoLong(self.limit));
        }
        target.push(byte);
        Ok(())
    }

    fn flush_pair<S: FormSink>(&mut self, sink: &mut S) -> Result<(), ErrorKind> {
        let in_value = std::mem::take(&mut self.in_value);
        let key = std::mem::take(&mut self.key);
        let value = std::mem::take(&mut self.value);

        if key.is_empty() && value.is_empty() && !in_value {
            return Ok(());
        }
        sink.field(utf8(key)?, utf8(value)?)
    }
}

// MULTIPART

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Preamble,
    AfterDelimiter,
    Headers,
    Body,
    Done,
}

enum Part {
    Field { name: String, value: Vec<u8> },
    File,
}

pub(crate) struct Multipart {
    delimiter: Vec<u8>,
    carry: Vec<u8>,
    state: State,
    part: Option<Part>,
    seen_file: bool,
    limit: usize,
}

impl Multipart {
    /// `limit` bounds simple field values and part header blocks.
    pub(crate) fn new(boundary: &str, limit: usize) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(b"\r\n--");
        delimiter.extend_from_slice(boundary.as_bytes());

        Self {
            delimiter,
            // The first boundary line has no CRLF before it
            carry: b"\r\n".to_vec(),
            state: State::Preamble,
            part: None,
            seen_file: false,
            limit,
        }
    }

    pub(crate) fn feed<S: FormSink>(&mut self, chunk: &[u8], sink: &mut S) -> Result<(), ErrorKind> {
        if self.state == State::Done {
            return Ok(());
        }
        self.carry.extend_from_slice(chunk);

        loop {
            match self.state {
                State::Preamble => match memmem::find(&self.carry, &self.delimiter) {
                    Some(i) => {
                        self.carry.drain(..i + self.delimiter.len());
                        self.state = State::AfterDelimiter;
                    }
                    None => {
                        let keep = self.delimiter.len() - 1;
                        let cut = self.carry.len().saturating_sub(keep);
                        self.carry.drain(..cut);
                        return Ok(());
                    }
                },
                State::AfterDelimiter => {
                    if self.carry.len() < 2 {
                        return Ok(());
                    }

                    match &self.carry[..2] {
                        b"--" => {
                            self.state = State::Done;
                            self.carry.clear();
                            return Ok(());
                        }
                        b"\r\n" => {
                            self.carry.drain(..2);
                            self.state = State::Headers;
                        }
                        [b' ' | b'\t', _] => {
                            self.carry.drain(..1);
                        }
                        _ => return Err(ErrorKind::BodyParse("malformed multipart boundary line".into())),
                    }
                }
                State::Headers => {
                    let (block_end, skip) = match self.carry.starts_with(b"\r\n") {
                        true => (0, 2),
                        false => match memmem::find(&self.carry, b"\r\n\r\n") {
                            Some(i) => (i, 4),
                            None => {
                                if self.carry.len() > self.limit {
                                    return Err(ErrorKind::BodySoLong(self.limit));
                                }
                                return Ok(());
                            }
                        },
                    };

                    let block: Vec<u8> = self.carry.drain(..block_end + skip).collect();
                    self.begin_part(&block[..block_end], sink)?;
                    self.state = State::Body;
                }
                State::Body => match memmem::find(&self.carry, &self.delimiter) {
                    Some(i) => {
                        let data: Vec<u8> = self.carry.drain(..i + self.delimiter.len()).collect();
                        self.part_data(&data[..i], sink)?;
                        self.end_part(sink)?;
                        self.state = State::AfterDelimiter;
                    }
                    None => {
                        let keep = self.delimiter.len() - 1;
                        let cut = self.carry.len().saturating_sub(keep);
                        if cut == 0 {
                            return Ok(());
                        }

                        let data: Vec<u8> = self.carry.drain(..cut).collect();
                        self.part_data(&data, sink)?;
                        return Ok(());
                    }
                },
                State::Done => return Ok(()),
            }
        }
    }

    pub(crate) fn finish(self) -> Result<(), ErrorKind> {
        match self.state {
            State::Done => Ok(()),
            _ => Err(ErrorKind::BodyParse(
                "multipart body ended before the closing boundary".into(),
            )),
        }
    }

    fn begin_part<S: FormSink>(&mut self, block: &[u8], sink: &mut S) -> Result<(), ErrorKind> {
        let block = simdutf8::basic::from_utf8(block)
            .map_err(|_| ErrorKind::BodyParse("part headers are not valid UTF-8".into()))?;

        let mut param_name = None;
        let mut file_name = None;
        let mut mime_type = None;

        for line in block.split("\r\n") {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };

            match name.trim().to_ascii_lowercase().as_str() {
                "content-disposition" => {
                    let (_, params) = types::parse_header_value(value);
                    for (key, val) in params {
                        match key.to_ascii_lowercase().as_str() {
                            "name" => param_name = Some(val.to_string()),
                            "filename" => file_name = Some(val.to_string()),
                            _ => {}
                        }
                    }
                }
                "content-type" => mime_type = Some(value.trim().to_string()),
                _ => {}
            }
        }

        let param_name = param_name
            .ok_or_else(|| ErrorKind::BodyParse("multipart part without a name".into()))?;

        match file_name {
            Some(file_name) => {
                self.seen_file = true;
                self.part = Some(Part::File);

                sink.file_begin(FileData {
                    file_name,
                    param_name,
                    mime_type: mime_type.unwrap_or_else(|| "text/plain".to_string()),
                })
            }
            None if self.seen_file => Err(ErrorKind::SimpleParamAfterFile),
            None => {
                self.part = Some(Part::Field {
                    name: param_name,
                    value: Vec::new(),
                });
                Ok(())
            }
        }
    }

    fn part_data<S: FormSink>(&mut self, data: &[u8], sink: &mut S) -> Result<(), ErrorKind> {
        match &mut self.part {
            Some(Part::Field { value, .. }) => {
                if value.len() + data.len() > self.limit {
                    return Err(ErrorKind::BodySoLong(self.limit));
                }
                value.extend_from_slice(data);
                Ok(())
            }
            Some(Part::File) if !data.is_empty() => sink.file_chunk(data),
            _ => Ok(()),
        }
    }

    fn end_part<S: FormSink>(&mut self, sink: &mut S) -> Result<(), ErrorKind> {
        match self.part.take() {
            Some(Part::Field { name, value }) => sink.field(name, utf8(value)?),
            Some(Part::File) => sink.file_end(),
            None => Ok(()),
        }
    }
}

// DRIVERS

pub(crate) async fn read_urlencoded<S: FormSink>(
    body: &mut BodyStream<'_>,
    limit: usize,
    sink: &mut S,
) -> Result<(), ErrorKind> {
    let mut decoder = UrlEncoded::new(limit);
    while let Some(chunk) = body.chunk().await? {
        decoder.feed(chunk, sink)?;
    }
    decoder.finish(sink)
}

pub(crate) async fn read_multipart<S: FormSink>(
    body: &mut BodyStream<'_>,
    boundary: &str,
    limit: usize,
    sink: &mut S,
) -> Result<(), ErrorKind> {
    let mut decoder = Multipart::new(boundary, limit);
    while let Some(chunk) = body.chunk().await? {
        decoder.feed(chunk, sink)?;
    }
    decoder.finish()
}
