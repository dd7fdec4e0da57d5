//! Extended Inquiry Response / advertising data decoding
//!
//! Advertising data is a sequence of `[length][type][length - 1 bytes]`
//! records. A zero length byte ends the significant part; anything after it is
//! padding.

use crate::error::{Error, Result};
use crate::gap::constants::*;
use crate::gap::types::Advertisement;
use crate::uuid::Uuid;
use log::trace;

fn malformed(offset: usize, reason: &'static str) -> Error {
    Error::MalformedAdvertisement { offset, reason }
}

impl Advertisement {
    /// Decode one advertising data blob.
    pub fn decode(eir: &[u8]) -> Result<Self> {
        let mut adv = Advertisement::new();
        adv.extend_from_eir(eir)?;
        Ok(adv)
    }

    /// Merge another blob, typically the scan response, into this record.
    ///
    /// Scalar fields are overwritten by later records, UUID lists and service
    /// data accumulate. On error, fields decoded from records before the
    /// malformed one are kept.
    pub fn extend_from_eir(&mut self, eir: &[u8]) -> Result<()> {
        let mut offset = 0;

        while eir.len() - offset >= 2 {
            let length = eir[offset] as usize;
            if length == 0 {
                break;
            }

            let end = offset + 1 + length;
            if end > eir.len() {
                return Err(malformed(offset, "record runs past the end of the data"));
            }

            let ad_type = eir[offset + 1];
            let data = &eir[offset + 2..end];
            self.apply_record(offset, ad_type, data)?;

            offset = end;
        }

        Ok(())
    }

    fn apply_record(&mut self, offset: usize, ad_type: u8, data: &[u8]) -> Result<()> {
        match ad_type {
            ADV_TYPE_FLAGS => {
                let flags = *data.first().ok_or(malformed(offset, "empty flags"))?;
                self.flags = Some(flags);
            }
            ADV_TYPE_16BIT_SERVICE_UUID_PARTIAL | ADV_TYPE_16BIT_SERVICE_UUID_COMPLETE => {
                if data.len() % 2 != 0 {
                    return Err(malformed(offset, "partial 16-bit service UUID"));
                }
                for chunk in data.chunks_exact(2) {
                    self.add_service(Uuid::from_u16(u16::from_le_bytes([chunk[0], chunk[1]])));
                }
            }
            ADV_TYPE_128BIT_SERVICE_UUID_PARTIAL | ADV_TYPE_128BIT_SERVICE_UUID_COMPLETE => {
                if data.len() % 16 != 0 {
                    return Err(malformed(offset, "partial 128-bit service UUID"));
                }
                for chunk in data.chunks_exact(16) {
                    if let Some(uuid) = Uuid::try_from_slice_le(chunk) {
                        self.add_service(uuid);
                    }
                }
            }
            ADV_TYPE_SHORT_LOCAL_NAME | ADV_TYPE_COMPLETE_LOCAL_NAME => {
                self.local_name = Some(String::from_utf8_lossy(data).into_owned());
            }
            ADV_TYPE_TX_POWER_LEVEL => {
                let level = *data.first().ok_or(malformed(offset, "empty tx power level"))?;
                self.tx_power_level = Some(level as i8);
            }
            ADV_TYPE_SERVICE_DATA_16BIT => {
                if data.len() < 2 {
                    return Err(malformed(offset, "service data shorter than its UUID"));
                }
                let uuid = Uuid::from_u16(u16::from_le_bytes([data[0], data[1]]));
                self.add_service_data(uuid, data[2..].to_vec());
            }
            ADV_TYPE_MANUFACTURER_SPECIFIC => {
                self.manufacturer_data = Some(data.to_vec());
            }
            other => trace!("Skipping advertising data type 0x{:02X}", other),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_hex(s: &str) -> Result<Advertisement> {
        Advertisement::decode(&hex::decode(s).unwrap())
    }

    #[test]
    fn test_128bit_service_list() {
        let adv = decode_hex("02010611061bc5d5a50200baafe211a88400fae13902ff01").unwrap();
        assert_eq!(adv.flags, Some(0x06));
        assert_eq!(adv.services.len(), 1);
        assert_eq!(adv.services[0].to_string(), "39e1fa0084a811e2afba0002a5d5c51b");
        assert_eq!(adv.manufacturer_data, Some(vec![0x01]));
    }

    #[test]
    fn test_local_name_and_tx_power() {
        let adv =
            decode_hex("1209466c6f77657220706f776572203235303205120a006400020a00").unwrap();
        assert_eq!(adv.local_name.as_deref(), Some("Flower power 2502"));
        assert_eq!(adv.tx_power_level, Some(0));
        assert!(adv.services.is_empty());

        let adv = decode_hex("020a04").unwrap();
        assert_eq!(adv.tx_power_level, Some(4));

        let adv = decode_hex("020af6").unwrap();
        assert_eq!(adv.tx_power_level, Some(-10));
    }

    #[test]
    fn test_manufacturer_data_and_name() {
        let adv =
            decode_hex("02010509ff0f000202f202203a100957494345442053656e7365204b6974").unwrap();
        assert_eq!(adv.flags, Some(0x05));
        assert_eq!(
            adv.manufacturer_data,
            Some(vec![0x0f, 0x00, 0x02, 0x02, 0xf2, 0x02, 0x20, 0x3a])
        );
        assert_eq!(adv.local_name.as_deref(), Some("WICED Sense Kit"));
        assert!(adv.services.is_empty());
    }

    #[test]
    fn test_16bit_service_list() {
        let adv = decode_hex("0201060302e0ff09ff5946010004390020").unwrap();
        assert_eq!(adv.services, vec![Uuid::from_u16(0xffe0)]);
        assert_eq!(adv.services[0].to_string(), "ffe0");
        assert_eq!(
            adv.manufacturer_data,
            Some(vec![0x59, 0x46, 0x01, 0x00, 0x04, 0x39, 0x00, 0x20])
        );

        let adv = decode_hex("050300180f18").unwrap();
        assert_eq!(adv.services, vec![Uuid::from_u16(0x1800), Uuid::from_u16(0x180f)]);
    }

    #[test]
    fn test_unknown_types_are_skipped() {
        let adv = decode_hex("08094e65787475726e051210009001").unwrap();
        assert_eq!(adv.local_name.as_deref(), Some("Nexturn"));
        assert!(adv.services.is_empty());
        assert_eq!(adv.manufacturer_data, None);
    }

    #[test]
    fn test_service_data() {
        let adv = decode_hex("0516d2fc4001").unwrap();
        assert_eq!(adv.service_data.len(), 1);
        assert_eq!(adv.service_data[0].uuid, Uuid::from_u16(0xfcd2));
        assert_eq!(adv.service_data_for(Uuid::from_u16(0xfcd2)), Some(&[0x40, 0x01][..]));

        // UUID only, empty payload
        let adv = decode_hex("03160f18").unwrap();
        assert_eq!(adv.service_data_for(Uuid::from_u16(0x180f)), Some(&[][..]));
    }

    #[test]
    fn test_duplicate_uuids_are_suppressed() {
        let adv = decode_hex("0302e0ff0303e0ff").unwrap();
        assert_eq!(adv.services, vec![Uuid::from_u16(0xffe0)]);
    }

    #[test]
    fn test_zero_length_terminates() {
        let adv = decode_hex("020106000000").unwrap();
        assert_eq!(adv.flags, Some(0x06));

        // A lone trailing byte is not a record.
        let adv = decode_hex("02010605").unwrap();
        assert_eq!(adv.flags, Some(0x06));

        assert_eq!(decode_hex("").unwrap(), Advertisement::default());
    }

    #[test]
    fn test_truncated_record() {
        match decode_hex("0201061109aabb") {
            Err(Error::MalformedAdvertisement { offset, .. }) => assert_eq!(offset, 3),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(matches!(
            decode_hex("0209"),
            Err(Error::MalformedAdvertisement { offset: 0, .. })
        ));
    }

    #[test]
    fn test_malformed_payloads() {
        // tx power with no value
        assert!(matches!(
            decode_hex("010a"),
            Err(Error::MalformedAdvertisement { offset: 0, .. })
        ));
        // odd-length 16-bit list
        assert!(matches!(
            decode_hex("0403e0ff01"),
            Err(Error::MalformedAdvertisement { offset: 0, .. })
        ));
        // 128-bit list one byte short
        assert!(matches!(
            decode_hex("10061bc5d5a50200baafe211a88400fae1"),
            Err(Error::MalformedAdvertisement { offset: 0, .. })
        ));
        // service data without a full UUID
        assert!(matches!(
            decode_hex("0216e0"),
            Err(Error::MalformedAdvertisement { offset: 0, .. })
        ));
    }

    #[test]
    fn test_every_truncation_is_handled() {
        let blob = hex::decode("02010611061bc5d5a50200baafe211a88400fae13902ff010516d2fc4001")
            .unwrap();
        for cut in 0..=blob.len() {
            // Never panics; either decodes a prefix or reports the offset.
            if let Err(Error::MalformedAdvertisement { offset, .. }) =
                Advertisement::decode(&blob[..cut])
            {
                assert!(offset < cut);
            }
        }
    }

    #[test]
    fn test_scan_response_merges() {
        let mut adv = decode_hex("0201060302e0ff").unwrap();
        adv.extend_from_eir(&hex::decode("08094e65787475726e0302e0ff020a02").unwrap())
            .unwrap();

        assert_eq!(adv.flags, Some(0x06));
        assert_eq!(adv.local_name.as_deref(), Some("Nexturn"));
        assert_eq!(adv.tx_power_level, Some(2));
        assert_eq!(adv.services, vec![Uuid::from_u16(0xffe0)]);
    }

    #[test]
    fn test_partial_fields_survive_error() {
        let mut adv = Advertisement::new();
        let result = adv.extend_from_eir(&hex::decode("08094e65787475726e010a").unwrap());
        assert!(result.is_err());
        assert_eq!(adv.local_name.as_deref(), Some("Nexturn"));
    }
}
