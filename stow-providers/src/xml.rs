// SPDX-License-Identifier: AGPL-3.0-or-later
//! Minimal XML scanning for S3 and WebDAV responses
//!
//! Not a parser: finds elements by local name (namespace prefix ignored) and
//! returns their raw inner text. Good enough for the flat, well-formed
//! documents these APIs return, regardless of line layout.

/// Inner content of every `<name>` element, in document order
pub(crate) fn elements<'a>(xml: &'a str, name: &str) -> Vec<&'a str> {
    let mut found = Vec::new();
    let mut pos = 0;

    while let Some(rel) = xml[pos..].find('<') {
        let start = pos + rel;
        let rest = &xml[start + 1..];
        if rest.starts_with('/') || rest.starts_with('?') || rest.starts_with('!') {
            pos = start + 1;
            continue;
        }

        let name_len = rest
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(rest.len());
        let qname = &rest[..name_len];
        let Some(tag_end) = rest.find('>') else { break };
        let open_end = start + 1 + tag_end + 1;

        if !local_name(qname).eq_ignore_ascii_case(name) {
            pos = start + 1;
            continue;
        }
        if rest[..tag_end].ends_with('/') {
            found.push("");
            pos = open_end;
            continue;
        }

        let closing = format!("</{}", qname);
        match xml[open_end..].find(&closing) {
            Some(close_rel) => {
                let close = open_end + close_rel;
                found.push(&xml[open_end..close]);
                pos = match xml[close..].find('>') {
                    Some(gt) => close + gt + 1,
                    None => xml.len(),
                };
            }
            None => break,
        }
    }
    found
}

/// Unescaped text of the first `<name>` element
pub(crate) fn text(xml: &str, name: &str) -> Option<String> {
    elements(xml, name).first().map(|raw| unescape(raw.trim()))
}

pub(crate) fn unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ if entity.starts_with("#x") => u32::from_str_radix(&entity[2..], 16)
                .ok()
                .and_then(char::from_u32),
            _ if entity.starts_with('#') => entity[1..].parse().ok().and_then(char::from_u32),
            _ => None,
        };
        match decoded {
            Some(c) => out.push(c),
            None => out.push_str(&tail[..=semi]),
        }
        rest = &tail[semi + 1..];
    }
    out.push_str(rest);
    out
}

pub(crate) fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn local_name(qname: &str) -> &str {
    qname.rsplit(':').next().unwrap_or(qname)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elements_on_one_line() {
        let xml = "<ListBucketResult><Contents><Key>a.txt</Key><Size>3</Size></Contents>\
                   <Contents><Key>b.txt</Key><Size>5</Size></Contents></ListBucketResult>";
        let contents = elements(xml, "Contents");
        assert_eq!(contents.len(), 2);
        assert_eq!(text(contents[1], "Key").as_deref(), Some("b.txt"));
        assert_eq!(text(contents[0], "Size").as_deref(), Some("3"));
    }

    #[test]
    fn test_namespace_prefix_and_self_closing() {
        let xml = r#"<d:multistatus xmlns:d="DAV:">
            <d:response>
              <d:href>/dav/dir/</d:href>
              <d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat>
            </d:response>
            <D:response><D:href>/dav/f</D:href><D:propstat><D:prop><D:resourcetype/></D:prop></D:propstat></D:response>
        </d:multistatus>"#;
        let responses = elements(xml, "response");
        assert_eq!(responses.len(), 2);
        assert_eq!(elements(responses[0], "collection"), vec![""]);
        assert!(elements(responses[1], "collection").is_empty());
        assert_eq!(text(responses[1], "href").as_deref(), Some("/dav/f"));
    }

    #[test]
    fn test_unescape_entities() {
        assert_eq!(unescape("a &amp; b &lt;c&gt; &#65;&#x42; &bogus;"), "a & b <c> AB &bogus;");
        assert_eq!(unescape("&quot;etag&quot;"), "\"etag\"");
        assert_eq!(escape("<x & \"y\">"), "&lt;x &amp; &quot;y&quot;&gt;");
    }
}
