use std::io::BufRead;

use crate::Error;

#[derive(Debug, Clone)]
/// A packet header.
/// Ordinary packets carry only `Content-Length`, but the engine's initial
/// handshake is a headers-only packet with extra fields (`Type: connect`,
/// `V8-Version`, `Protocol-Version`, `Embedding-Host`). As such, this type
/// retains fields it does not know about.
pub struct Header {
    /// The length of the content part in bytes.
    pub len: usize,
    /// The list of header fields, both known and unknown.
    pub fields: Vec<HeaderField>,
}

impl Header {
    /// Take a list of `HeaderField` and return a Header if the list carries
    /// a content length.
    fn from_raw_fields(fields: Vec<HeaderField>) -> Option<Self> {
        // try finding the ContentLength field
        let len = fields.iter().find_map(|field| match field {
            HeaderField::Len(num) => Some(*num),
            _ => None,
        })?; // if unable to find the content field, return none

        Some(Self { len, fields })
    }

    pub fn read_from<R: BufRead>(input: &mut R) -> Result<Header, Error> {
        let mut fields = Vec::new();

        // an empty line signifies the end of the header
        while let Some(field) = HeaderField::read_from(input)? {
            fields.push(field);
        }

        Header::from_raw_fields(fields).ok_or(Error::BadPacket)
    }

    /// The value of a named field, if present.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.iter().find_map(|field| match field {
            HeaderField::Other { name: n, value } if n == name => Some(value.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A packet header field.
pub enum HeaderField {
    /// The length of the content part in bytes.
    Len(usize),
    /// An unknown field.
    Other { name: String, value: String },
}

impl HeaderField {
    fn specialize(self) -> Result<Self, Error> {
        match self {
            HeaderField::Other { name, value } if name == "Content-Length" => {
                let length = value.as_str().parse().or(Err(Error::BadPacket))?;
                Ok(HeaderField::Len(length))
            }
            _ => Ok(self),
        }
    }

    fn read_from<R: BufRead>(input: &mut R) -> Result<Option<HeaderField>, Error> {
        let mut line = String::new();
        input.read_line(&mut line)?;

        // a header field is composed of a name and a value separated by ':'
        let mut parts = line
            .splitn(2, ':')
            .map(str::trim)
            .filter(|part| !part.is_empty());

        let name = parts.next();
        let value = parts.next();

        match (name, value) {
            // if the line is empty: return None
            (None, None) => Ok(None),
            (Some(name), Some(value)) => {
                let header = HeaderField::Other {
                    name: name.to_string(),
                    value: value.to_string(),
                }
                .specialize()?;
                Ok(Some(header))
            }
            _ => Err(Error::BadPacket),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bstr::B;

    #[test]
    fn parse_header_field_valid_content_length() {
        let header = HeaderField::read_from(&mut B("Content-Length:6\r\n"))
            .unwrap()
            .unwrap();
        match header {
            HeaderField::Len(6) => (),
            _ => panic!(),
        }
    }

    #[test]
    fn parse_header_field_valid_unknown_field() {
        let field = HeaderField::read_from(&mut B("Type:connect\r\n"))
            .unwrap()
            .unwrap();
        match field {
            HeaderField::Other { name, value } => {
                assert_eq!(name, "Type");
                assert_eq!(value, "connect");
            }
            _ => {
                panic!()
            }
        }
    }

    #[test]
    fn parse_header_field_value_with_colon() {
        // the engine's Embedding-Host field may itself contain a ':'
        let field = HeaderField::read_from(&mut B("Embedding-Host:node v0.10:x\r\n"))
            .unwrap()
            .unwrap();
        match field {
            HeaderField::Other { name, value } => {
                assert_eq!(name, "Embedding-Host");
                assert_eq!(value, "node v0.10:x");
            }
            _ => panic!(),
        }
    }

    #[test]
    fn parse_header_field_empty_line() {
        let none = HeaderField::read_from(&mut B("\r\n")).unwrap();
        assert_eq!(none, None);
    }

    #[test]
    fn parse_header_field_name_only() {
        let err = HeaderField::read_from(&mut B("name:"));
        match err {
            Err(Error::BadPacket) => (),
            _ => panic!(),
        }
    }

    #[test]
    #[should_panic]
    fn parse_header_empty_input() {
        Header::read_from(&mut B("")).unwrap();
    }

    #[test]
    fn parse_header_valid_header() {
        let header = Header::read_from(&mut B("Content-Length:415\r\n\r\n")).unwrap();

        assert_eq!(header.len, 415);

        assert_eq!(header.fields[0], HeaderField::Len(415));
        assert_eq!(header.fields.get(1), None)
    }

    #[test]
    fn parse_header_handshake() {
        let header = Header::read_from(&mut B(
            "Type:connect\r\nV8-Version:3.14.5.9\r\nProtocol-Version:1\r\nContent-Length:0\r\n\r\n",
        ))
        .unwrap();

        assert_eq!(header.len, 0);
        assert_eq!(header.field("Type"), Some("connect"));
        assert_eq!(header.field("V8-Version"), Some("3.14.5.9"));
        assert_eq!(header.field("Embedding-Host"), None);
    }

    #[test]
    fn from_raw_fields_valid() {
        let header = Header::from_raw_fields(vec![HeaderField::Len(1)]).unwrap();

        assert_eq!(header.len, 1);
        assert_eq!(header.fields.get(0), Some(&HeaderField::Len(1)));
        assert_eq!(header.fields.get(1), None);
    }

    #[test]
    fn from_raw_fields_without_length() {
        let none = Header::from_raw_fields(vec![HeaderField::Other {
            name: "Type".to_string(),
            value: "connect".to_string(),
        }]);
        assert!(none.is_none());
    }
}
