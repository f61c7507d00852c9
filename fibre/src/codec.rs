//! Wire codecs. A codec converts between a typed value and its byte
//! representation: little-endian fixed-width integers (bool included),
//! IEEE-754 floats reinterpreted as their bit pattern, and enums reduced to
//! their underlying integer. The `endpoint_ref` codec is special: on the
//! wire it is an `(endpoint_id, json_crc)` pair, locally an arena handle.

use byteorder::{ByteOrder, LittleEndian};

use crate::domain::{ObjectHandle, ObjectLookup};
use crate::status::RichResult;

/// A value with a fixed-size little-endian wire form.
pub trait Codec: Sized {
    /// Wire-level codec name, as it appears in interface descriptors.
    const WIRE_NAME: &'static str;

    fn decode(buffer: &mut &[u8]) -> RichResult<Self>;
    fn encode(&self, buffer: &mut Vec<u8>);
}

macro_rules! int_codec {
    ($ty:ty, $name:expr, $read:expr, $write:expr, $size:expr) => {
        impl Codec for $ty {
            const WIRE_NAME: &'static str = $name;

            fn decode(buffer: &mut &[u8]) -> RichResult<$ty> {
                if buffer.len() < $size {
                    return Err(rich_err!("decode failed: buffer too short"));
                }
                let value = $read(&buffer[..$size]);
                *buffer = &buffer[$size..];
                Ok(value)
            }

            fn encode(&self, buffer: &mut Vec<u8>) {
                let mut bytes = [0u8; $size];
                $write(&mut bytes, *self);
                buffer.extend_from_slice(&bytes);
            }
        }
    };
}

int_codec!(u16, "uint16", LittleEndian::read_u16, LittleEndian::write_u16, 2);
int_codec!(u32, "uint32", LittleEndian::read_u32, LittleEndian::write_u32, 4);
int_codec!(u64, "uint64", LittleEndian::read_u64, LittleEndian::write_u64, 8);
int_codec!(i16, "int16", LittleEndian::read_i16, LittleEndian::write_i16, 2);
int_codec!(i32, "int32", LittleEndian::read_i32, LittleEndian::write_i32, 4);
int_codec!(i64, "int64", LittleEndian::read_i64, LittleEndian::write_i64, 8);

impl Codec for u8 {
    const WIRE_NAME: &'static str = "uint8";

    fn decode(buffer: &mut &[u8]) -> RichResult<u8> {
        match buffer.split_first() {
            Some((&value, rest)) => {
                *buffer = rest;
                Ok(value)
            }
            None => Err(rich_err!("decode failed: empty buffer")),
        }
    }

    fn encode(&self, buffer: &mut Vec<u8>) {
        buffer.push(*self);
    }
}

impl Codec for i8 {
    const WIRE_NAME: &'static str = "int8";

    fn decode(buffer: &mut &[u8]) -> RichResult<i8> {
        u8::decode(buffer).map(|v| v as i8)
    }

    fn encode(&self, buffer: &mut Vec<u8>) {
        (*self as u8).encode(buffer);
    }
}

impl Codec for bool {
    const WIRE_NAME: &'static str = "bool";

    fn decode(buffer: &mut &[u8]) -> RichResult<bool> {
        u8::decode(buffer).map(|v| v != 0)
    }

    fn encode(&self, buffer: &mut Vec<u8>) {
        (*self as u8).encode(buffer);
    }
}

/// Floats travel as their IEEE-754 bit pattern in a u32.
impl Codec for f32 {
    const WIRE_NAME: &'static str = "float";

    fn decode(buffer: &mut &[u8]) -> RichResult<f32> {
        u32::decode(buffer).map(f32::from_bits)
    }

    fn encode(&self, buffer: &mut Vec<u8>) {
        self.to_bits().encode(buffer);
    }
}

/// Derives a `Codec` for a fieldless enum via its underlying integer type.
#[macro_export]
macro_rules! enum_codec {
    ($ty:ty, $underlying:ty, { $($variant:path = $value:expr),+ $(,)? }) => {
        impl $crate::codec::Codec for $ty {
            const WIRE_NAME: &'static str = <$underlying as $crate::codec::Codec>::WIRE_NAME;

            fn decode(buffer: &mut &[u8]) -> $crate::status::RichResult<$ty> {
                let raw = <$underlying as $crate::codec::Codec>::decode(buffer)?;
                match raw {
                    $($value => Ok($variant),)+
                    other => Err($crate::rich_err!("invalid enum value {}", other)),
                }
            }

            fn encode(&self, buffer: &mut Vec<u8>) {
                let raw: $underlying = match self {
                    $($variant => $value,)+
                };
                $crate::codec::Codec::encode(&raw, buffer);
            }
        }
    };
}

/// Wire form of an object reference.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct EndpointRef {
    pub ep_num: u16,
    pub json_crc: u16,
}

impl Codec for EndpointRef {
    const WIRE_NAME: &'static str = "endpoint_ref";

    fn decode(buffer: &mut &[u8]) -> RichResult<EndpointRef> {
        Ok(EndpointRef {
            ep_num: u16::decode(buffer)?,
            json_crc: u16::decode(buffer)?,
        })
    }

    fn encode(&self, buffer: &mut Vec<u8>) {
        self.ep_num.encode(buffer);
        self.json_crc.encode(buffer);
    }
}

/// Direction of an argument transcode between wire and local form.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transcode {
    /// Local 8-byte object handle -> wire `(ep_num, json_crc)`.
    EndpointRefEncode,
    /// Wire `(ep_num, json_crc)` -> local 8-byte object handle.
    EndpointRefDecode,
}

impl Transcode {
    /// The application-visible codec name a transcoded argument maps to.
    pub fn app_codec(&self) -> &'static str {
        "object_ref"
    }

    /// Looks up the transcoder for a wire codec name, or `None` for plain
    /// pass-through codecs. `decode` selects the wire-to-local direction.
    pub fn for_wire_codec(name: &str, decode: bool) -> Option<Transcode> {
        match name {
            "endpoint_ref" if decode => Some(Transcode::EndpointRefDecode),
            "endpoint_ref" => Some(Transcode::EndpointRefEncode),
            _ => None,
        }
    }

    /// Rewrites `buf` in place. Returns false when the input is malformed.
    pub fn transcode(&self, lookup: &dyn ObjectLookup, buf: &mut Vec<u8>) -> bool {
        match self {
            Transcode::EndpointRefEncode => {
                if buf.len() < 8 {
                    return false;
                }
                let handle = ObjectHandle::from_raw(LittleEndian::read_u64(buf));
                let wire = lookup
                    .ref_of(handle)
                    .unwrap_or_default();
                buf.clear();
                wire.encode(buf);
                true
            }
            Transcode::EndpointRefDecode => {
                if buf.len() < 4 {
                    return false;
                }
                let mut bytes = &buf[..];
                let wire = EndpointRef::decode(&mut bytes).expect("length checked");
                let handle = lookup.object_by_ref(wire.ep_num, wire.json_crc);
                buf.clear();
                let mut raw = [0u8; 8];
                LittleEndian::write_u64(&mut raw, handle.to_raw());
                buf.extend_from_slice(&raw);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ObjectHandle;

    struct FakeLookup {
        objects: Vec<(u16, u16)>, // (ep_num, json_crc) per handle index
    }

    impl ObjectLookup for FakeLookup {
        fn object_by_ref(&self, ep_num: u16, json_crc: u16) -> ObjectHandle {
            for (i, &(ep, crc)) in self.objects.iter().enumerate() {
                if ep == ep_num && crc == json_crc {
                    return ObjectHandle::from_index(i);
                }
            }
            ObjectHandle::NULL
        }

        fn ref_of(&self, handle: ObjectHandle) -> Option<EndpointRef> {
            let (ep_num, json_crc) = *self.objects.get(handle.index()?)?;
            Some(EndpointRef { ep_num, json_crc })
        }
    }

    #[test]
    fn test_int_round_trips() {
        fn round_trip<T: Codec + Copy + PartialEq + std::fmt::Debug>(value: T) {
            let mut buf = Vec::new();
            value.encode(&mut buf);
            let mut bytes = &buf[..];
            assert_eq!(T::decode(&mut bytes).unwrap(), value);
            assert!(bytes.is_empty());
        }

        round_trip(0u8);
        round_trip(0xffu8);
        round_trip(-1i8);
        round_trip(0x1234u16);
        round_trip(-2i16);
        round_trip(0xdeadbeefu32);
        round_trip(-77i32);
        round_trip(u64::max_value());
        round_trip(i64::min_value());
        round_trip(true);
        round_trip(false);
    }

    #[test]
    fn test_little_endian_layout() {
        let mut buf = Vec::new();
        0x0403_0201u32.encode(&mut buf);
        assert_eq!(buf, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_float_as_bits() {
        let mut buf = Vec::new();
        1.5f32.encode(&mut buf);
        assert_eq!(buf, 1.5f32.to_bits().to_le_bytes());

        let mut bytes = &buf[..];
        assert_eq!(f32::decode(&mut bytes).unwrap(), 1.5);
    }

    #[test]
    fn test_decode_too_short() {
        let mut bytes: &[u8] = &[1, 2];
        assert!(u32::decode(&mut bytes).is_err());
    }

    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    enum Gain {
        Low,
        High,
    }

    enum_codec!(Gain, u32, {
        Gain::Low = 0,
        Gain::High = 1,
    });

    #[test]
    fn test_enum_codec() {
        let mut buf = Vec::new();
        Gain::High.encode(&mut buf);
        assert_eq!(buf, vec![1, 0, 0, 0]);

        let mut bytes = &buf[..];
        assert_eq!(Gain::decode(&mut bytes).unwrap(), Gain::High);

        let mut bytes: &[u8] = &[9, 0, 0, 0];
        assert!(Gain::decode(&mut bytes).is_err());
    }

    #[test]
    fn test_endpoint_ref_round_trip() {
        let lookup = FakeLookup {
            objects: vec![(3, 0x9abc), (7, 0x9abc)],
        };

        // local handle of object 1 -> wire pair -> same handle
        let mut buf = ObjectHandle::from_index(1).to_raw().to_le_bytes().to_vec();
        assert!(Transcode::EndpointRefEncode.transcode(&lookup, &mut buf));
        assert_eq!(buf, vec![7, 0, 0xbc, 0x9a]);

        assert!(Transcode::EndpointRefDecode.transcode(&lookup, &mut buf));
        let raw = LittleEndian::read_u64(&buf);
        assert_eq!(ObjectHandle::from_raw(raw), ObjectHandle::from_index(1));
    }

    #[test]
    fn test_endpoint_ref_unknown_decodes_to_null() {
        let lookup = FakeLookup {
            objects: vec![(3, 0x9abc)],
        };

        let mut buf = Vec::new();
        EndpointRef {
            ep_num: 3,
            json_crc: 0x1111, // wrong crc
        }
        .encode(&mut buf);

        assert!(Transcode::EndpointRefDecode.transcode(&lookup, &mut buf));
        assert_eq!(LittleEndian::read_u64(&buf), ObjectHandle::NULL.to_raw());
    }

    #[test]
    fn test_null_handle_encodes_to_zero_pair() {
        let lookup = FakeLookup { objects: vec![] };

        let mut buf = ObjectHandle::NULL.to_raw().to_le_bytes().to_vec();
        assert!(Transcode::EndpointRefEncode.transcode(&lookup, &mut buf));
        assert_eq!(buf, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_transcoder_lookup() {
        assert_eq!(
            Transcode::for_wire_codec("endpoint_ref", true),
            Some(Transcode::EndpointRefDecode)
        );
        assert_eq!(
            Transcode::for_wire_codec("endpoint_ref", false),
            Some(Transcode::EndpointRefEncode)
        );
        assert_eq!(Transcode::for_wire_codec("uint32", true), None);
        assert_eq!(Transcode::EndpointRefDecode.app_codec(), "object_ref");
    }

    #[test]
    fn test_transcode_short_input_rejected() {
        let lookup = FakeLookup { objects: vec![] };

        let mut buf = vec![1, 2, 3];
        assert!(!Transcode::EndpointRefEncode.transcode(&lookup, &mut buf));
        assert!(!Transcode::EndpointRefDecode.transcode(&lookup, &mut buf));
    }
}
