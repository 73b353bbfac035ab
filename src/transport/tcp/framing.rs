/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use quick_xml::Reader;
use quick_xml::errors::SyntaxError;
use quick_xml::events::Event;

use crate::Element;
use crate::Error;
use crate::Result;
use crate::constants::STREAM_TAG;
use crate::error::description;

/// One unit of the inbound XML stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    /// The server's `<stream:stream>` opening tag.
    Open(Element),
    /// A complete top level element: a stanza, features, or an error.
    Element(Element),
    /// `</stream:stream>`
    Close,
}

/// Splits received bytes into frames.
#[derive(Default)]
pub(crate) struct Framer {
    buffer: Vec<u8>,
}

impl Framer {
    pub(crate) fn new() -> Self {
        Framer::default()
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Takes the next complete frame off the buffer, if there is one.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        // Whitespace between stanzas is a keepalive.
        let start = self
            .buffer
            .iter()
            .position(|byte| !byte.is_ascii_whitespace())
            .unwrap_or(self.buffer.len());
        self.buffer.drain(..start);
        if self.buffer.is_empty() {
            return Ok(None);
        }
        match extract(&self.buffer)? {
            Some((frame, consumed)) => {
                self.buffer.drain(..consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

fn is_stream_tag(name: &[u8]) -> bool {
    name == STREAM_TAG.as_bytes()
}

fn incomplete(err: &quick_xml::Error) -> bool {
    matches!(
        err,
        quick_xml::Error::Syntax(
            SyntaxError::UnclosedTag
                | SyntaxError::UnclosedPIOrXmlDecl
                | SyntaxError::UnclosedComment
                | SyntaxError::UnclosedCData
                | SyntaxError::UnclosedDoctype
        )
    )
}

fn element_at(buffer: &[u8]) -> Result<Element> {
    let text = std::str::from_utf8(buffer).map_err(|err| Error::BadXml(err.to_string()))?;
    Element::parse(text)
}

fn extract(buffer: &[u8]) -> Result<Option<(Frame, usize)>> {
    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;
    reader.config_mut().allow_unmatched_ends = true;

    let mut depth: usize = 0;
    let mut start: usize = 0;
    loop {
        let pos = reader.buffer_position() as usize;
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(err) if incomplete(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match event {
            Event::Start(tag) => {
                if depth == 0 && is_stream_tag(tag.name().as_ref()) {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::Open(Element::from_start(&tag)?), end)));
                }
                if depth == 0 {
                    start = pos;
                }
                depth += 1;
            }
            Event::Empty(tag) => {
                if depth == 0 {
                    let end = reader.buffer_position() as usize;
                    let element = Element::from_start(&tag)?;
                    if is_stream_tag(tag.name().as_ref()) {
                        return Ok(Some((Frame::Open(element), end)));
                    }
                    return Ok(Some((Frame::Element(element), end)));
                }
            }
            Event::End(tag) => {
                if depth == 0 {
                    if is_stream_tag(tag.name().as_ref()) {
                        let end = reader.buffer_position() as usize;
                        return Ok(Some((Frame::Close, end)));
                    }
                    return Err(Error::BadXml(description::UNEXPECTED_END_TAG.into()));
                }
                depth -= 1;
                if depth == 0 {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::Element(element_at(&buffer[start..end])?), end)));
                }
            }
            Event::Eof => return Ok(None),
            // Declarations, text, comments: nothing to frame.
            _ => {}
        }
    }
}
