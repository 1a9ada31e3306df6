//! In-place edits of libvirt domain XML.
//!
//! Documents are streamed event by event, so everything outside the edited
//! element is written back exactly as read.

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;

#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    #[error("malformed XML: {0}")]
    Malformed(String),

    #[error("element {0} not found")]
    MissingElement(&'static str),
}

fn malformed(e: impl std::fmt::Display) -> XmlError {
    XmlError::Malformed(e.to_string())
}

/// Rewrite the first `<parent><child .../>` element with `edit`.
///
/// `edit` returns `None` to leave the element untouched.
fn rewrite_first<F>(
    xml: &str,
    parent: &[u8],
    child: &[u8],
    label: &'static str,
    mut edit: F,
) -> Result<String, XmlError>
where
    F: FnMut(&BytesStart<'_>) -> Result<Option<BytesStart<'static>>, XmlError>,
{
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len()));
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut found = false;

    let mut apply = |e: BytesStart<'_>,
                     stack: &[Vec<u8>],
                     found: &mut bool|
     -> Result<BytesStart<'static>, XmlError> {
        let matches = !*found
            && e.name().as_ref() == child
            && stack.last().is_some_and(|p| p.as_slice() == parent);
        if !matches {
            return Ok(e.into_owned());
        }
        *found = true;
        Ok(edit(&e)?.unwrap_or_else(|| e.into_owned()))
    };

    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Eof => break,
            Event::Start(e) => {
                let e = apply(e, &stack, &mut found)?;
                stack.push(e.name().as_ref().to_vec());
                writer.write_event(Event::Start(e)).map_err(malformed)?;
            }
            Event::Empty(e) => {
                let e = apply(e, &stack, &mut found)?;
                writer.write_event(Event::Empty(e)).map_err(malformed)?;
            }
            Event::End(e) => {
                stack.pop();
                writer.write_event(Event::End(e)).map_err(malformed)?;
            }
            other => writer.write_event(other).map_err(malformed)?,
        }
    }

    if !found {
        return Err(XmlError::MissingElement(label));
    }
    String::from_utf8(writer.into_inner()).map_err(malformed)
}

/// Copy of `e` with attribute `key` set to `value`, keeping attribute order.
fn with_attribute(e: &BytesStart<'_>, key: &str, value: &str) -> Result<BytesStart<'static>, XmlError> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut out = BytesStart::new(name);
    let mut replaced = false;
    for attr in e.attributes() {
        let attr = attr.map_err(malformed)?;
        if attr.key.as_ref() == key.as_bytes() {
            out.push_attribute((key, value));
            replaced = true;
        } else {
            out.push_attribute(attr);
        }
    }
    if !replaced {
        out.push_attribute((key, value));
    }
    Ok(out)
}

fn attribute(e: &BytesStart<'_>, key: &str) -> Result<Option<String>, XmlError> {
    match e.try_get_attribute(key).map_err(malformed)? {
        Some(attr) => Ok(Some(attr.unescape_value().map_err(malformed)?.into_owned())),
        None => Ok(None),
    }
}

/// Set `machine` on `os/type` unless the document already names one.
pub fn ensure_machine_type(xml: &str, machine: &str) -> Result<String, XmlError> {
    rewrite_first(xml, b"os", b"type", "os/type", |e| {
        if attribute(e, "machine")?.is_some() {
            return Ok(None);
        }
        with_attribute(e, "machine", machine).map(Some)
    })
}

/// Point the first `os/boot` element at `device` (`hd`, `network`, ...).
pub fn set_boot_device(xml: &str, device: &str) -> Result<String, XmlError> {
    rewrite_first(xml, b"os", b"boot", "os/boot", |e| {
        with_attribute(e, "dev", device).map(Some)
    })
}

/// `dev` of the first `os/boot` element.
pub fn boot_device(xml: &str) -> Result<Option<String>, XmlError> {
    let mut reader = Reader::from_str(xml);
    let mut parent_is_os = Vec::new();
    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Eof => return Ok(None),
            Event::Start(e) => {
                if e.name().as_ref() == b"boot" && parent_is_os.last() == Some(&true) {
                    return attribute(&e, "dev");
                }
                parent_is_os.push(e.name().as_ref() == b"os");
            }
            Event::Empty(e) => {
                if e.name().as_ref() == b"boot" && parent_is_os.last() == Some(&true) {
                    return attribute(&e, "dev");
                }
            }
            Event::End(_) => {
                parent_is_os.pop();
            }
            _ => {}
        }
    }
}
