use crate::types::CompressionError;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
struct TableEntry {
    pub size: usize,
    pub name: Bytes,
    pub value: Bytes,
}

impl TableEntry {
    pub fn new(name: Bytes, value: Bytes) -> Self {
        Self {
            // https://httpwg.org/specs/rfc7541.html#calculating.table.size
            size: name.len() + value.len() + 32,
            name,
            value,
        }
    }
}

macro_rules! static_table {
    ( $( $name:expr => $value:expr ),+ ) => {
        [
            $(
                TableEntry {
                    size: $name.len() + $value.len() + 32,
                    name: Bytes::from_static($name),
                    value: Bytes::from_static($value),
                }
            ),+
        ]
    };
}

/// https://httpwg.org/specs/rfc7541.html#static.table.definition
static STATIC_TABLE: [TableEntry; 61] = static_table![
    b":authority" => b"",
    b":method" => b"GET",
    b":method" => b"POST",
    b":path" => b"/",
    b":path" => b"/index.html",
    b":scheme" => b"http",
    b":scheme" => b"https",
    b":status" => b"200",
    b":status" => b"204",
    b":status" => b"206",
    b":status" => b"304",
    b":status" => b"400",
    b":status" => b"404",
    b":status" => b"500",
    b"accept-charset" => b"",
    b"accept-encoding" => b"gzip, deflate",
    b"accept-language" => b"",
    b"accept-ranges" => b"",
    b"accept" => b"",
    b"access-control-allow-origin" => b"",
    b"age" => b"",
    b"allow" => b"",
    b"authorization" => b"",
    b"cache-control" => b"",
    b"content-disposition" => b"",
    b"content-encoding" => b"",
    b"content-language" => b"",
    b"content-length" => b"",
    b"content-location" => b"",
    b"content-range" => b"",
    b"content-type" => b"",
    b"cookie" => b"",
    b"date" => b"",
    b"etag" => b"",
    b"expect" => b"",
    b"expires" => b"",
    b"from" => b"",
    b"host" => b"",
    b"if-match" => b"",
    b"if-modified-since" => b"",
    b"if-none-match" => b"",
    b"if-range" => b"",
    b"if-unmodified-since" => b"",
    b"last-modified" => b"",
    b"link" => b"",
    b"location" => b"",
    b"max-forwards" => b"",
    b"proxy-authenticate" => b"",
    b"proxy-authorization" => b"",
    b"range" => b"",
    b"referer" => b"",
    b"refresh" => b"",
    b"retry-after" => b"",
    b"server" => b"",
    b"set-cookie" => b"",
    b"strict-transport-security" => b"",
    b"transfer-encoding" => b"",
    b"user-agent" => b"",
    b"vary" => b"",
    b"via" => b"",
    b"www-authenticate" => b""
];

/// Values for these names are transmitted never-indexed and kept out of the
/// dynamic table.
const NEVER_INDEXED: [&str; 2] = ["authorization", "cookie"];

enum Lookup {
    /// Index whose name and value both match.
    Full(usize),
    /// Index whose name matches; value differs.
    Name(usize),
    Miss,
}

/// Static table plus one direction's dynamic table, addressed by a single
/// 1-based index space: 1..=61 static, 62.. dynamic (newest first).
#[derive(Debug, Clone)]
struct Table {
    max_size: usize,
    current_size: usize,
    table: VecDeque<TableEntry>,
}

impl Table {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            current_size: 0,
            table: VecDeque::with_capacity(max_size / std::mem::size_of::<TableEntry>()),
        }
    }

    pub fn get(&self, index: usize) -> Option<&TableEntry> {
        let index = index.checked_sub(1)?;
        STATIC_TABLE
            .get(index)
            .or_else(|| self.table.get(index - STATIC_TABLE.len()))
    }

    fn lookup(&self, name: &[u8], value: &[u8]) -> Lookup {
        let mut name_index = None;
        for (i, entry) in STATIC_TABLE.iter().chain(self.table.iter()).enumerate() {
            if entry.name.as_ref() == name {
                if entry.value.as_ref() == value {
                    return Lookup::Full(i + 1);
                }
                if name_index.is_none() {
                    name_index = Some(i + 1);
                }
            }
        }
        name_index.map_or(Lookup::Miss, Lookup::Name)
    }

    /// Inserts at the front and evicts from the back until the size bound
    /// holds again. An entry larger than the bound therefore empties the
    /// table entirely.
    pub fn push(&mut self, name: Bytes, value: Bytes) {
        let entry = TableEntry::new(name, value);
        self.current_size += entry.size;
        self.table.push_front(entry);
        self.resize(self.max_size);
    }

    pub fn resize(&mut self, size: usize) {
        self.max_size = size;
        while self.current_size > self.max_size {
            if let Some(popped) = self.table.pop_back() {
                self.current_size -= popped.size;
            } else {
                break;
            }
        }
    }
}

/// https://httpwg.org/specs/rfc7541.html#integer.representation
fn encode_integer(out: &mut BytesMut, mask: u8, prefix_bits: u8, mut value: usize) {
    let limit = (1usize << prefix_bits) - 1;
    if value < limit {
        out.put_u8(mask | value as u8);
        return;
    }
    out.put_u8(mask | limit as u8);
    value -= limit;
    while value >= 0x80 {
        out.put_u8((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    out.put_u8(value as u8);
}

fn decode_integer(data: &[u8], prefix_bits: u8) -> Result<(usize, &[u8]), CompressionError> {
    let limit = (1usize << prefix_bits) - 1;
    let first = *data.first().ok_or(CompressionError::Truncated)?;
    let mut value = (first & limit as u8) as usize;
    let mut rest = &data[1..];
    if value < limit {
        return Ok((value, rest));
    }
    let mut shift = 0u32;
    loop {
        let byte = *rest.first().ok_or(CompressionError::Truncated)?;
        rest = &rest[1..];
        if shift >= 63 {
            return Err(CompressionError::IntegerOverflow);
        }
        let add = ((byte & 0x7f) as usize)
            .checked_shl(shift)
            .ok_or(CompressionError::IntegerOverflow)?;
        value = value
            .checked_add(add)
            .ok_or(CompressionError::IntegerOverflow)?;
        if byte & 0x80 == 0 {
            return Ok((value, rest));
        }
        shift += 7;
    }
}

/// https://httpwg.org/specs/rfc7541.html#string.literal.representation
fn encode_string(out: &mut BytesMut, s: &[u8]) {
    encode_integer(out, 0, 7, s.len());
    out.put_slice(s);
}

fn decode_string(data: &[u8]) -> Result<(Bytes, &[u8]), CompressionError> {
    let first = *data.first().ok_or(CompressionError::Truncated)?;
    if first & 0x80 != 0 {
        return Err(CompressionError::HuffmanNotSupported);
    }
    let (len, rest) = decode_integer(data, 7)?;
    if rest.len() < len {
        return Err(CompressionError::Truncated);
    }
    Ok((Bytes::copy_from_slice(&rest[..len]), &rest[len..]))
}

/// Outbound half of the codec. Its dynamic table mirrors what the peer's
/// decoder will build from the representations we emit, so both stay in sync
/// without any feedback channel.
#[derive(Debug, Clone)]
pub struct Encoder {
    table: Table,
    pending_resize: Option<usize>,
}

impl Encoder {
    #[must_use]
    pub fn with_size(dynamic_table_size: usize) -> Self {
        Self {
            table: Table::new(dynamic_table_size),
            pending_resize: None,
        }
    }

    /// Applies the peer's new HEADER_TABLE_SIZE. The size update
    /// representation announcing it leads the next encoded block.
    pub fn resize(&mut self, size: usize) {
        if size == self.table.max_size && self.pending_resize.is_none() {
            return;
        }
        self.table.resize(size);
        self.pending_resize = Some(size);
    }

    pub fn encode<'a>(&mut self, headers: impl IntoIterator<Item = (&'a str, &'a str)>) -> Bytes {
        let mut out = BytesMut::new();
        if let Some(size) = self.pending_resize.take() {
            encode_integer(&mut out, 0x20, 5, size);
        }
        for (name, value) in headers {
            let name = name.to_ascii_lowercase();
            let value = value.as_bytes();
            if NEVER_INDEXED.contains(&name.as_str()) {
                match self.table.lookup(name.as_bytes(), value) {
                    Lookup::Full(index) | Lookup::Name(index) => {
                        encode_integer(&mut out, 0x10, 4, index);
                    }
                    Lookup::Miss => {
                        out.put_u8(0x10);
                        encode_string(&mut out, name.as_bytes());
                    }
                }
                encode_string(&mut out, value);
                continue;
            }
            match self.table.lookup(name.as_bytes(), value) {
                Lookup::Full(index) => encode_integer(&mut out, 0x80, 7, index),
                Lookup::Name(index) => {
                    encode_integer(&mut out, 0x40, 6, index);
                    encode_string(&mut out, value);
                    self.table.push(
                        Bytes::copy_from_slice(name.as_bytes()),
                        Bytes::copy_from_slice(value),
                    );
                }
                Lookup::Miss => {
                    out.put_u8(0x40);
                    encode_string(&mut out, name.as_bytes());
                    encode_string(&mut out, value);
                    self.table.push(
                        Bytes::copy_from_slice(name.as_bytes()),
                        Bytes::copy_from_slice(value),
                    );
                }
            }
        }
        out.freeze()
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::with_size(4096)
    }
}

/// Inbound half of the codec. `capacity_limit` is the HEADER_TABLE_SIZE we
/// advertised; a size update above it is a compression error.
#[derive(Debug, Clone)]
pub struct Decoder {
    table: Table,
    capacity_limit: usize,
}

impl Decoder {
    #[must_use]
    pub fn with_size(dynamic_table_size: usize) -> Self {
        Self {
            table: Table::new(dynamic_table_size),
            capacity_limit: dynamic_table_size,
        }
    }

    /// https://httpwg.org/specs/rfc7541.html#detailed.format
    pub fn decode(&mut self, mut data: &[u8]) -> Result<Vec<(Bytes, Bytes)>, CompressionError> {
        let mut headers = Vec::new();
        while let Some(&first) = data.first() {
            if first & 0x80 != 0 {
                // indexed field
                let (index, rest) = decode_integer(data, 7)?;
                data = rest;
                let entry = self
                    .table
                    .get(index)
                    .ok_or(CompressionError::InvalidIndex(index))?;
                headers.push((entry.name.clone(), entry.value.clone()));
            } else if first & 0xc0 == 0x40 {
                // literal with incremental indexing
                let (name, value, rest) = self.decode_literal(data, 6)?;
                data = rest;
                self.table.push(name.clone(), value.clone());
                headers.push((name, value));
            } else if first & 0xe0 == 0x20 {
                // dynamic table size update
                let (size, rest) = decode_integer(data, 5)?;
                data = rest;
                if size > self.capacity_limit {
                    return Err(CompressionError::SizeUpdateTooLarge {
                        size,
                        limit: self.capacity_limit,
                    });
                }
                self.table.resize(size);
            } else {
                // literal without indexing (0000) or never indexed (0001)
                let (name, value, rest) = self.decode_literal(data, 4)?;
                data = rest;
                headers.push((name, value));
            }
        }
        Ok(headers)
    }

    fn decode_literal<'a>(
        &self,
        data: &'a [u8],
        prefix_bits: u8,
    ) -> Result<(Bytes, Bytes, &'a [u8]), CompressionError> {
        let (index, rest) = decode_integer(data, prefix_bits)?;
        let (name, rest) = if index == 0 {
            decode_string(rest)?
        } else {
            let entry = self
                .table
                .get(index)
                .ok_or(CompressionError::InvalidIndex(index))?;
            (entry.name.clone(), rest)
        };
        let (value, rest) = decode_string(rest)?;
        Ok((name, value, rest))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::with_size(4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::hpack as their_hpack;

    fn encode_int(mask: u8, prefix_bits: u8, value: usize) -> Vec<u8> {
        let mut out = BytesMut::new();
        encode_integer(&mut out, mask, prefix_bits, value);
        out.to_vec()
    }

    #[test]
    fn integer_examples() {
        // https://httpwg.org/specs/rfc7541.html#integer.representation.examples
        assert_eq!(encode_int(0, 5, 10), vec![0b0000_1010]);
        assert_eq!(encode_int(0, 5, 1337), vec![0b0001_1111, 0b1001_1010, 0b0000_1010]);
        assert_eq!(encode_int(0, 8, 42), vec![0b0010_1010]);
    }

    #[test]
    fn integer_roundtrip() {
        for prefix_bits in 1..=8 {
            for value in [0usize, 1, 30, 31, 127, 128, 255, 16_384, u32::MAX as usize] {
                let bytes = encode_int(0, prefix_bits, value);
                let (decoded, rest) = decode_integer(&bytes, prefix_bits).unwrap();
                assert_eq!(decoded, value, "prefix {}", prefix_bits);
                assert!(rest.is_empty());
            }
        }
    }

    #[test]
    fn truncated_integer() {
        assert_eq!(
            decode_integer(&[0b0001_1111, 0x80], 5),
            Err(CompressionError::Truncated)
        );
    }

    #[test]
    fn indexed_static_headers() {
        let mut encoder = Encoder::default();
        assert_eq!(encoder.encode(vec![(":method", "GET")]).as_ref(), &[0x82]);
        assert_eq!(
            encoder
                .encode(vec![(":method", "GET"), (":path", "/")])
                .as_ref(),
            &[0x82, 0x84]
        );

        let mut decoder = Decoder::default();
        assert_eq!(
            decoder.decode(&[0x82]).unwrap(),
            vec![(Bytes::from_static(b":method"), Bytes::from_static(b"GET"))]
        );
        assert_eq!(
            decoder.decode(&[0x82, 0x84]).unwrap(),
            vec![
                (Bytes::from_static(b":method"), Bytes::from_static(b"GET")),
                (Bytes::from_static(b":path"), Bytes::from_static(b"/")),
            ]
        );
    }

    #[test]
    fn names_are_lowercased() {
        let mut encoder = Encoder::default();
        let mut decoder = Decoder::default();
        let decoded = decoder
            .decode(&encoder.encode(vec![("X-Custom", "1")]))
            .unwrap();
        assert_eq!(decoded[0].0.as_ref(), b"x-custom");
    }

    #[test]
    fn dynamic_table_reuse() {
        let mut encoder = Encoder::default();
        let first = encoder.encode(vec![("x-trace", "abc")]);
        // literal with incremental indexing, new name
        assert_eq!(first[0], 0x40);
        let second = encoder.encode(vec![("x-trace", "abc")]);
        // now an indexed reference to dynamic index 62
        assert_eq!(second.as_ref(), &[0x80 | 62]);

        let mut decoder = Decoder::default();
        let expected = vec![(Bytes::from_static(b"x-trace"), Bytes::from_static(b"abc"))];
        assert_eq!(decoder.decode(&first).unwrap(), expected);
        assert_eq!(decoder.decode(&second).unwrap(), expected);
    }

    #[test]
    fn oversized_entry_empties_table() {
        let mut table = Table::new(64);
        table.push(Bytes::from_static(b"a"), Bytes::from_static(b"b"));
        assert_eq!(table.table.len(), 1);
        let big = Bytes::from(vec![b'x'; 128]);
        table.push(Bytes::from_static(b"big"), big);
        assert_eq!(table.table.len(), 0);
        assert_eq!(table.current_size, 0);
    }

    #[test]
    fn eviction_pops_oldest() {
        // each entry is 34 octets, so the third insert evicts the first
        let mut table = Table::new(68);
        table.push(Bytes::from_static(b"a"), Bytes::from_static(b"1"));
        table.push(Bytes::from_static(b"b"), Bytes::from_static(b"2"));
        table.push(Bytes::from_static(b"c"), Bytes::from_static(b"3"));
        assert_eq!(table.table.len(), 2);
        assert_eq!(table.get(62).unwrap().name.as_ref(), b"c");
        assert_eq!(table.get(63).unwrap().name.as_ref(), b"b");
        assert!(table.get(64).is_none());
    }

    #[test]
    fn size_update_is_applied() {
        let mut decoder = Decoder::default();
        // literal with incremental indexing: foo: bar
        decoder
            .decode(&[0x40, 0x03, b'f', b'o', b'o', 0x03, b'b', b'a', b'r'])
            .unwrap();
        assert_eq!(decoder.table.table.len(), 1);
        // size update to zero empties the dynamic table
        decoder.decode(&[0x20]).unwrap();
        assert_eq!(decoder.table.table.len(), 0);
        assert_eq!(decoder.table.current_size, 0);
    }

    #[test]
    fn size_update_above_limit_is_rejected() {
        let mut decoder = Decoder::with_size(4096);
        let mut block = BytesMut::new();
        encode_integer(&mut block, 0x20, 5, 8192);
        assert_eq!(
            decoder.decode(&block),
            Err(CompressionError::SizeUpdateTooLarge {
                size: 8192,
                limit: 4096
            })
        );
    }

    #[test]
    fn huffman_strings_are_rejected() {
        let mut decoder = Decoder::default();
        // literal, new name, huffman bit set on the name length
        assert_eq!(
            decoder.decode(&[0x40, 0x81, 0xff]),
            Err(CompressionError::HuffmanNotSupported)
        );
    }

    #[test]
    fn invalid_index_is_rejected() {
        let mut decoder = Decoder::default();
        assert_eq!(
            decoder.decode(&[0x80 | 70]),
            Err(CompressionError::InvalidIndex(70))
        );
        assert_eq!(
            decoder.decode(&[0x80]),
            Err(CompressionError::InvalidIndex(0))
        );
    }

    #[test]
    fn never_indexed_sensitive_values() {
        let mut encoder = Encoder::default();
        let block = encoder.encode(vec![("authorization", "Bearer t0ken")]);
        // 0001 pattern with the static name index for authorization
        assert_eq!(block[0] & 0xf0, 0x10);
        let mut decoder = Decoder::default();
        let decoded = decoder.decode(&block).unwrap();
        assert_eq!(
            decoded,
            vec![(
                Bytes::from_static(b"authorization"),
                Bytes::from_static(b"Bearer t0ken")
            )]
        );
        // nothing was added to either dynamic table
        assert_eq!(encoder.table.table.len(), 0);
        assert_eq!(decoder.table.table.len(), 0);
    }

    #[test]
    fn encode() {
        let mut encoder = Encoder::default();
        let mut decoder = their_hpack::Decoder::new();

        let headers = vec![
            (":method", "GET"),
            (":path", "/"),
            ("x-request-id", "0451"),
        ];
        assert_eq!(
            decoder.decode(&encoder.encode(headers.clone())).unwrap(),
            headers
                .into_iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn decode() {
        let mut decoder = Decoder::default();
        let mut encoder = their_hpack::Encoder::new();

        let headers = vec![
            (&b":method"[..], &b"GET"[..]),
            (&b":path"[..], &b"/"[..]),
            (&b"x-request-id"[..], &b"0451"[..]),
        ];
        assert_eq!(
            decoder.decode(&encoder.encode(headers.clone())).unwrap(),
            headers
                .into_iter()
                .map(|(k, v)| (Bytes::copy_from_slice(k), Bytes::copy_from_slice(v)))
                .collect::<Vec<_>>()
        );
    }
}
