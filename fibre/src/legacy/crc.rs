//! CRC parameters of the legacy packet framing. These are fixed by the
//! installed base and must match exactly: CRC-8 poly 0x37 init 0x42 over
//! the packet header, CRC-16 poly 0x3d65 init 0x1337 over the payload.

use lazy_static::lazy_static;

pub const CRC8_POLYNOMIAL: u8 = 0x37;
pub const CRC8_INIT: u8 = 0x42;

pub const CRC16_POLYNOMIAL: u16 = 0x3d65;
pub const CRC16_INIT: u16 = 0x1337;

lazy_static! {
    static ref CRC16_TABLE: [u16; 256] = {
        let mut table = [0u16; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let mut crc = (i as u16) << 8;
            for _ in 0..8 {
                crc = if crc & 0x8000 != 0 {
                    (crc << 1) ^ CRC16_POLYNOMIAL
                } else {
                    crc << 1
                };
            }
            *entry = crc;
        }
        table
    };
}

/// MSB-first CRC-8, no reflection, no final xor.
pub fn crc8(init: u8, data: &[u8]) -> u8 {
    let mut crc = init;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ CRC8_POLYNOMIAL
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// MSB-first CRC-16, table driven, no reflection, no final xor.
pub fn crc16(init: u16, data: &[u8]) -> u16 {
    let mut crc = init;
    for &byte in data {
        crc = (crc << 8) ^ CRC16_TABLE[((crc >> 8) ^ byte as u16) as usize];
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crc16_bitwise(init: u16, data: &[u8]) -> u16 {
        let mut crc = init;
        for &byte in data {
            crc ^= (byte as u16) << 8;
            for _ in 0..8 {
                crc = if crc & 0x8000 != 0 {
                    (crc << 1) ^ CRC16_POLYNOMIAL
                } else {
                    crc << 1
                };
            }
        }
        crc
    }

    #[test]
    fn test_table_matches_bitwise() {
        let data: Vec<u8> = (0u16..300).map(|v| (v * 7) as u8).collect();
        assert_eq!(crc16(CRC16_INIT, &data), crc16_bitwise(CRC16_INIT, &data));
        assert_eq!(crc16(0, &data), crc16_bitwise(0, &data));
    }

    #[test]
    fn test_crc8_self_check() {
        // feeding the CRC of the data back in yields zero
        let data = [0xaa, 0x06];
        let crc = crc8(CRC8_INIT, &data);
        assert_eq!(crc8(CRC8_INIT, &[0xaa, 0x06, crc]), 0);
    }

    #[test]
    fn test_crc16_self_check_big_endian_trailer() {
        let payload = b"hello fibre";
        let crc = crc16(CRC16_INIT, payload);
        let mut with_trailer = payload.to_vec();
        with_trailer.push((crc >> 8) as u8);
        with_trailer.push((crc & 0xff) as u8);
        assert_eq!(crc16(CRC16_INIT, &with_trailer), 0);
    }

    #[test]
    fn test_crc_distinguishes_inputs() {
        assert_ne!(crc16(CRC16_INIT, b"abc"), crc16(CRC16_INIT, b"abd"));
        assert_ne!(crc8(CRC8_INIT, &[1, 2]), crc8(CRC8_INIT, &[2, 1]));
    }
}
