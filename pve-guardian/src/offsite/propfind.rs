//! PROPFIND multistatus parsing.

use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;

use super::OffsiteError;

pub const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:resourcetype/>
    <d:getcontentlength/>
    <d:getlastmodified/>
  </d:prop>
</d:propfind>"#;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DavEntry {
    pub href: String,
    pub is_collection: bool,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
}

impl DavEntry {
    /// Percent-decoded last path segment of the href.
    pub fn name(&self) -> String {
        let trimmed = self.href.trim_end_matches('/');
        let segment = trimmed.rsplit('/').next().unwrap_or(trimmed);
        urlencoding::decode(segment)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| segment.to_string())
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    Href,
    Length,
    Modified,
}

/// Parse a `207 Multi-Status` body. Namespace prefixes are ignored.
pub fn parse_multistatus(body: &str) -> Result<Vec<DavEntry>, OffsiteError> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<DavEntry> = None;
    let mut field: Option<Field> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"response" => current = Some(DavEntry::default()),
                b"href" => field = Some(Field::Href),
                b"getcontentlength" => field = Some(Field::Length),
                b"getlastmodified" => field = Some(Field::Modified),
                b"collection" => {
                    if let Some(entry) = current.as_mut() {
                        entry.is_collection = true;
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"collection" {
                    if let Some(entry) = current.as_mut() {
                        entry.is_collection = true;
                    }
                }
            }
            Ok(Event::Text(e)) => {
                let (Some(entry), Some(f)) = (current.as_mut(), field) else {
                    continue;
                };
                let text = e
                    .unescape()
                    .map_err(|err| OffsiteError::Xml(err.to_string()))?;
                let text = text.trim();
                match f {
                    Field::Href => entry.href = text.to_string(),
                    Field::Length => entry.size = text.parse().ok(),
                    Field::Modified => {
                        entry.modified = DateTime::parse_from_rfc2822(text)
                            .ok()
                            .map(|t| t.with_timezone(&Utc))
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"response" => {
                    if let Some(entry) = current.take() {
                        if !entry.href.is_empty() {
                            entries.push(entry);
                        }
                    }
                }
                _ => field = None,
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(OffsiteError::Xml(format!(
                    "at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    const LISTING: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/dav/backups/</D:href>
    <D:propstat><D:prop>
      <D:resourcetype><D:collection/></D:resourcetype>
      <D:getlastmodified>Mon, 15 Jan 2024 02:00:00 GMT</D:getlastmodified>
    </D:prop><D:status>HTTP/1.1 200 OK</D:status></D:propstat>
  </D:response>
  <D:response>
    <D:href>/dav/backups/vzdump-qemu-100-2024_01_15-02_00_03.vma.zst</D:href>
    <D:propstat><D:prop>
      <D:resourcetype/>
      <D:getcontentlength>1048576</D:getcontentlength>
      <D:getlastmodified>Mon, 15 Jan 2024 02:10:00 GMT</D:getlastmodified>
    </D:prop><D:status>HTTP/1.1 200 OK</D:status></D:propstat>
  </D:response>
  <D:response>
    <D:href>/dav/backups/my%20archive%26more.tar.gz</D:href>
    <D:propstat><D:prop>
      <D:resourcetype></D:resourcetype>
      <D:getcontentlength>12</D:getcontentlength>
    </D:prop><D:status>HTTP/1.1 200 OK</D:status></D:propstat>
  </D:response>
</D:multistatus>"#;

    #[test]
    fn test_parse_listing() {
        let entries = parse_multistatus(LISTING).unwrap();
        assert_eq!(entries.len(), 3);

        assert!(entries[0].is_collection);
        assert_eq!(entries[0].name(), "backups");

        assert!(!entries[1].is_collection);
        assert_eq!(entries[1].name(), "vzdump-qemu-100-2024_01_15-02_00_03.vma.zst");
        assert_eq!(entries[1].size, Some(1_048_576));
        assert_eq!(entries[1].modified.map(|m| m.day()), Some(15));

        assert_eq!(entries[2].name(), "my archive&more.tar.gz");
        assert_eq!(entries[2].modified, None);
    }

    #[test]
    fn test_parse_lowercase_namespace_prefix() {
        let body = r#"<d:multistatus xmlns:d="DAV:"><d:response><d:href>http://nas/remote.php/webdav/a.vma</d:href></d:response></d:multistatus>"#;
        let entries = parse_multistatus(body).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name(), "a.vma");
    }

    #[test]
    fn test_parse_malformed() {
        assert!(parse_multistatus("<d:multistatus><d:response></d:multistatus>").is_err());
    }
}
