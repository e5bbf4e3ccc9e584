//! Decoder for the textual EEPROM dumps returned by `show-eeprom`.
//!
//! A dump is a run of 33-byte groups: 32 ASCII hex digits followed by one
//! separator byte. Decoding strips the separators and hex-decodes the rest
//! into a flat image addressed as `page * PAGE_LENGTH + offset`.

use thiserror::Error;

use crate::types::Measurement;

pub const PAGE_LENGTH: usize = 128;

const GROUP_LENGTH: usize = 33;
const HEX_CHUNK_LENGTH: usize = 32;

pub const PAGE_LOW_TEMP: usize = address(0, 0x0E);
pub const PAGE_LOW_VCC: usize = address(0, 0x10);
pub const PAGE_11H_TX_PWR: usize = address(5, 0x1A);
pub const PAGE_11H_RX_PWR: usize = address(5, 0x3A);
pub const PAGE_25H_OSNR: usize = address(7, 0x16);

const fn address(page: usize, offset: usize) -> usize {
    page * PAGE_LENGTH + offset
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("dump length {0} is not a whole number of 33-byte groups")]
    Length(usize),
    #[error("dump is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("image too short for {field}: need {required} bytes, have {actual}")]
    Truncated {
        field: &'static str,
        required: usize,
        actual: usize,
    },
}

/// Decoded EEPROM image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eeprom(Vec<u8>);

pub fn decode(raw: &[u8]) -> Result<Eeprom, DecodeError> {
    // The last group may come without its separator.
    match raw.len() % GROUP_LENGTH {
        0 | HEX_CHUNK_LENGTH => {}
        _ => return Err(DecodeError::Length(raw.len())),
    }

    let hex_digits: Vec<u8> = raw
        .chunks(GROUP_LENGTH)
        .flat_map(|group| &group[..HEX_CHUNK_LENGTH])
        .copied()
        .collect();

    Ok(Eeprom(hex::decode(hex_digits)?))
}

#[cfg(test)]
impl Eeprom {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Eeprom(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Eeprom {
    fn word(&self, field: &'static str, address: usize) -> Result<[u8; 2], DecodeError> {
        let required = address + 2;
        match self.0.get(address..required) {
            Some(&[hi, lo]) => Ok([hi, lo]),
            _ => Err(DecodeError::Truncated {
                field,
                required,
                actual: self.0.len(),
            }),
        }
    }

    /// Module temperature in °C (signed 1/256 °C steps, scaled by 10).
    pub fn temperature(&self) -> Result<f64, DecodeError> {
        let raw = i16::from_be_bytes(self.word("temperature", PAGE_LOW_TEMP)?);
        Ok(f64::from(raw) * 10.0 / 256.0)
    }

    /// Supply voltage in V (100 µV steps).
    pub fn voltage(&self) -> Result<f64, DecodeError> {
        let raw = u16::from_be_bytes(self.word("voltage", PAGE_LOW_VCC)?);
        Ok(f64::from(raw) / 10000.0)
    }

    pub fn tx_power(&self) -> Result<f64, DecodeError> {
        let raw = u16::from_be_bytes(self.word("tx_power", PAGE_11H_TX_PWR)?);
        Ok(micro_watt_01_to_dbm(raw))
    }

    pub fn rx_power(&self) -> Result<f64, DecodeError> {
        let raw = u16::from_be_bytes(self.word("rx_power", PAGE_11H_RX_PWR)?);
        Ok(micro_watt_01_to_dbm(raw))
    }

    pub fn osnr(&self) -> Result<f64, DecodeError> {
        let raw = u16::from_be_bytes(self.word("osnr", PAGE_25H_OSNR)?);
        Ok(f64::from(raw) / 10.0)
    }

    pub fn measurement(&self) -> Result<Measurement, DecodeError> {
        Ok(Measurement {
            temperature: self.temperature()?,
            voltage: self.voltage()?,
            tx_power: self.tx_power()?,
            rx_power: self.rx_power()?,
            osnr: self.osnr()?,
        })
    }
}

// Power readings are in 0.1 µW units; 10000 units = 1 mW = 0 dBm.
fn micro_watt_01_to_dbm(raw: u16) -> f64 {
    10.0 * (f64::from(raw) / 10000.0).log10()
}
