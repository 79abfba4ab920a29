use once_cell::sync::Lazy;
use uuid::Uuid;

/// Computed once per process and reused for every multipart body, mirroring frontik
/// `util._BOUNDARY = utf8(uuid4().hex)`, which is generated once at module import.
static BOUNDARY: Lazy<String> = Lazy::new(|| Uuid::new_v4().simple().to_string());

/// One value for a multipart field: either a scalar or a list that expands into one part per
/// element (frontik `make_mfd`'s handling of list-valued fields).
#[derive(Debug, Clone)]
pub enum FieldValue {
    One(String),
    Many(Vec<String>),
}

/// One uploaded file for a multipart field.
#[derive(Debug, Clone)]
pub struct FilePart {
    pub filename: String,
    pub body: Vec<u8>,
    /// `None` means "guess from filename", matching the source's `application/unknown` sentinel.
    pub content_type: Option<String>,
}

/// Build a `multipart/form-data` body and its `Content-Type` header value from fields and files,
/// reusing the single process-lifetime boundary (frontik `util.py`'s module-level `_BOUNDARY`).
pub fn make_mfd(
    fields: &[(String, FieldValue)],
    files: &[(String, Vec<FilePart>)],
) -> (Vec<u8>, String) {
    let boundary = BOUNDARY.as_str();
    let mut body = Vec::new();

    for (name, value) in fields {
        match value {
            FieldValue::One(v) => append_field(&mut body, &boundary, name, v),
            FieldValue::Many(values) => {
                for v in values {
                    append_field(&mut body, &boundary, name, v);
                }
            }
        }
    }

    for (name, parts) in files {
        for file in parts {
            append_file_field(&mut body, &boundary, name, file);
        }
    }

    body.extend_from_slice(b"--");
    body.extend_from_slice(boundary.as_bytes());
    body.extend_from_slice(b"--\r\n");

    let content_type = format!("multipart/form-data; boundary={boundary}");
    (body, content_type)
}

fn addslashes(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

fn append_field(body: &mut Vec<u8>, boundary: &str, name: &str, value: &str) {
    body.extend_from_slice(b"--");
    body.extend_from_slice(boundary.as_bytes());
    body.extend_from_slice(b"\r\nContent-Disposition: form-data; name=\"");
    body.extend_from_slice(addslashes(name).as_bytes());
    body.extend_from_slice(b"\"\r\n\r\n");
    body.extend_from_slice(value.as_bytes());
    body.extend_from_slice(b"\r\n");
}

fn append_file_field(body: &mut Vec<u8>, boundary: &str, name: &str, file: &FilePart) {
    let content_type = file.content_type.clone().unwrap_or_else(|| {
        mime_guess::from_path(&file.filename)
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_owned()
    });
    let content_type = content_type.replace('\n', " ").replace('\r', " ");

    body.extend_from_slice(b"--");
    body.extend_from_slice(boundary.as_bytes());
    body.extend_from_slice(b"\r\nContent-Disposition: form-data; name=\"");
    body.extend_from_slice(addslashes(name).as_bytes());
    body.extend_from_slice(b"\"; filename=\"");
    body.extend_from_slice(addslashes(&file.filename).as_bytes());
    body.extend_from_slice(b"\"\r\nContent-Type: ");
    body.extend_from_slice(content_type.as_bytes());
    body.extend_from_slice(b"\r\n\r\n");
    body.extend_from_slice(&file.body);
    body.extend_from_slice(b"\r\n");
}

/// Parse a `multipart/form-data` body built by `make_mfd` back into its fields and files,
/// recovering the round-trip law in spec §8 ("modulo list-field ordering preserved" — this
/// parser preserves it by emitting one entry per part in body order).
pub fn parse_mfd(body: &[u8], boundary: &str) -> (Vec<(String, String)>, Vec<(String, FilePart)>) {
    let delimiter = format!("--{boundary}");
    let mut fields = Vec::new();
    let mut files = Vec::new();

    let text_boundary = delimiter.as_bytes();
    let mut parts: Vec<&[u8]> = split_on(body, text_boundary);
    // first split chunk is empty preamble, last is the closing `--\r\n`
    if !parts.is_empty() {
        parts.remove(0);
    }
    if let Some(last) = parts.last() {
        if last.starts_with(b"--") {
            parts.pop();
        }
    }

    for part in parts {
        let part = part.strip_prefix(b"\r\n").unwrap_or(part);
        let Some(header_end) = find_subslice(part, b"\r\n\r\n") else {
            continue;
        };
        let headers = String::from_utf8_lossy(&part[..header_end]);
        let content = &part[header_end + 4..];
        let content = content.strip_suffix(b"\r\n").unwrap_or(content);

        let name = extract_quoted(&headers, "name=\"");
        let filename = extract_quoted(&headers, "filename=\"");

        match (name, filename) {
            (Some(name), Some(filename)) => {
                let content_type = headers
                    .lines()
                    .find(|l| l.to_ascii_lowercase().starts_with("content-type:"))
                    .map(|l| l.splitn(2, ':').nth(1).unwrap_or("").trim().to_owned());
                files.push((
                    name,
                    FilePart {
                        filename,
                        body: content.to_vec(),
                        content_type,
                    },
                ));
            }
            (Some(name), None) => {
                fields.push((name, String::from_utf8_lossy(content).into_owned()));
            }
            _ => {}
        }
    }

    (fields, files)
}

fn split_on<'a>(haystack: &'a [u8], needle: &[u8]) -> Vec<&'a [u8]> {
    let mut out = Vec::new();
    let mut rest = haystack;
    while let Some(pos) = find_subslice(rest, needle) {
        out.push(&rest[..pos]);
        rest = &rest[pos + needle.len()..];
    }
    out.push(rest);
    out
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn extract_quoted(headers: &str, marker: &str) -> Option<String> {
    let start = headers.find(marker)? + marker.len();
    let end = headers[start..].find('"')? + start;
    Some(headers[start..end].replace("\\\"", "\"").replace("\\\\", "\\"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_fields_and_files() {
        let fields = vec![
            ("name".to_owned(), FieldValue::One("value".to_owned())),
            (
                "tags".to_owned(),
                FieldValue::Many(vec!["a".to_owned(), "b".to_owned()]),
            ),
        ];
        let files = vec![(
            "upload".to_owned(),
            vec![FilePart {
                filename: "a.txt".to_owned(),
                body: b"hello world".to_vec(),
                content_type: Some("text/plain".to_owned()),
            }],
        )];

        let (body, content_type) = make_mfd(&fields, &files);
        let boundary = content_type.rsplit('=').next().unwrap();
        let (parsed_fields, parsed_files) = parse_mfd(&body, boundary);

        assert_eq!(
            parsed_fields,
            vec![
                ("name".to_owned(), "value".to_owned()),
                ("tags".to_owned(), "a".to_owned()),
                ("tags".to_owned(), "b".to_owned()),
            ]
        );
        assert_eq!(parsed_files.len(), 1);
        assert_eq!(parsed_files[0].0, "upload");
        assert_eq!(parsed_files[0].1.body, b"hello world");
        assert_eq!(parsed_files[0].1.filename, "a.txt");
    }

    #[test]
    fn guesses_content_type_from_extension_when_absent() {
        let files = vec![(
            "upload".to_owned(),
            vec![FilePart {
                filename: "a.json".to_owned(),
                body: b"{}".to_vec(),
                content_type: None,
            }],
        )];
        let (body, content_type) = make_mfd(&[], &files);
        let boundary = content_type.rsplit('=').next().unwrap();
        let (_, parsed_files) = parse_mfd(&body, boundary);
        assert_eq!(parsed_files[0].1.content_type.as_deref(), Some("application/json"));
    }

    #[test]
    fn escapes_quotes_and_backslashes_in_names() {
        let fields = vec![("weird\"name".to_owned(), FieldValue::One("v".to_owned()))];
        let (body, _) = make_mfd(&fields, &[]);
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("name=\"weird\\\"name\""));
    }
}
