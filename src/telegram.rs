//! DSMR P1 telegram framing and decoding.
//!
//! A telegram is an ASCII block starting with `/` (meter identification) and ending with
//! `!` followed by a CRC16 (DSMR 4 and 5, absent on 2.2). Every line in between is an OBIS
//! reference followed by one or more parenthesised values, e.g. `1-0:1.8.1(001234.567*kWh)`.

use chrono::{FixedOffset, NaiveDate, NaiveDateTime};
use std::fmt;

use crate::error::TelegramError;

/// Every value this service reads from a telegram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    DsmrVersion,
    Timestamp,
    EquipmentId,
    ElectricityUsedTariff1,
    ElectricityUsedTariff2,
    ElectricityReturnedTariff1,
    ElectricityReturnedTariff2,
    ActiveTariff,
    CurrentlyDelivered,
    CurrentlyReturned,
    LongPowerFailureCount,
    VoltageSagCountL1,
    VoltageSwellCountL1,
    DeviceType,
    PowerDeliveredL1,
    PowerReturnedL1,
    GasEquipmentId,
    GasReading,
    VoltageL1,
    CurrentL1,
}

impl Field {
    pub fn obis(self) -> &'static str {
        match self {
            Field::DsmrVersion => "1-3:0.2.8",
            Field::Timestamp => "0-0:1.0.0",
            Field::EquipmentId => "0-0:96.1.1",
            Field::ElectricityUsedTariff1 => "1-0:1.8.1",
            Field::ElectricityUsedTariff2 => "1-0:1.8.2",
            Field::ElectricityReturnedTariff1 => "1-0:2.8.1",
            Field::ElectricityReturnedTariff2 => "1-0:2.8.2",
            Field::ActiveTariff => "0-0:96.14.0",
            Field::CurrentlyDelivered => "1-0:1.7.0",
            Field::CurrentlyReturned => "1-0:2.7.0",
            Field::LongPowerFailureCount => "0-0:96.7.9",
            Field::VoltageSagCountL1 => "1-0:32.32.0",
            Field::VoltageSwellCountL1 => "1-0:32.36.0",
            Field::DeviceType => "0-1:24.1.0",
            Field::PowerDeliveredL1 => "1-0:21.7.0",
            Field::PowerReturnedL1 => "1-0:22.7.0",
            Field::GasEquipmentId => "0-1:96.1.0",
            Field::GasReading => "0-1:24.2.1",
            Field::VoltageL1 => "1-0:32.7.0",
            Field::CurrentL1 => "1-0:31.7.0",
        }
    }

    fn from_obis(obis: &str) -> Option<Field> {
        Some(match obis {
            "1-3:0.2.8" => Field::DsmrVersion,
            "0-0:1.0.0" => Field::Timestamp,
            "0-0:96.1.1" => Field::EquipmentId,
            "1-0:1.8.1" => Field::ElectricityUsedTariff1,
            "1-0:1.8.2" => Field::ElectricityUsedTariff2,
            "1-0:2.8.1" => Field::ElectricityReturnedTariff1,
            "1-0:2.8.2" => Field::ElectricityReturnedTariff2,
            "0-0:96.14.0" => Field::ActiveTariff,
            "1-0:1.7.0" => Field::CurrentlyDelivered,
            "1-0:2.7.0" => Field::CurrentlyReturned,
            "0-0:96.7.9" => Field::LongPowerFailureCount,
            "1-0:32.32.0" => Field::VoltageSagCountL1,
            "1-0:32.36.0" => Field::VoltageSwellCountL1,
            "0-1:24.1.0" => Field::DeviceType,
            "1-0:21.7.0" => Field::PowerDeliveredL1,
            "1-0:22.7.0" => Field::PowerReturnedL1,
            "0-1:96.1.0" => Field::GasEquipmentId,
            "0-1:24.2.1" => Field::GasReading,
            "1-0:32.7.0" => Field::VoltageL1,
            "1-0:31.7.0" => Field::CurrentL1,
            _ => return None,
        })
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.obis())
    }
}

/// A decoded value as it appeared in the telegram.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
    /// Meter wall-clock time and the offset its DST flag implies, if it sent one.
    Timestamp(NaiveDateTime, Option<FixedOffset>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => f.write_str(s),
            Value::Timestamp(t, None) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S")),
            Value::Timestamp(t, Some(offset)) => {
                write!(f, "{}{offset}", t.format("%Y-%m-%d %H:%M:%S"))
            }
        }
    }
}

/// One decoded P1 message. Fields the meter did not send are simply absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Telegram {
    pub header: String,
    values: Vec<(Field, Value)>,
}

impl Telegram {
    pub fn get(&self, field: Field) -> Option<&Value> {
        self.values
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, value)| value)
    }

    /// Numeric value of `field`, if present and numeric.
    pub fn number(&self, field: Field) -> Option<f64> {
        match self.get(field) {
            Some(Value::Number(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn insert(&mut self, field: Field, value: Value) {
        match self.values.iter_mut().find(|(f, _)| *f == field) {
            Some(slot) => slot.1 = value,
            None => self.values.push((field, value)),
        }
    }

    /// Decodes a complete telegram. `verify_crc` is off for DSMR 2.2 meters.
    pub fn parse(raw: &[u8], verify_crc: bool) -> Result<Telegram, TelegramError> {
        let text = std::str::from_utf8(raw).map_err(|_| TelegramError::Encoding)?;
        let footer = text.rfind('!').ok_or(TelegramError::MissingFooter)?;

        if verify_crc {
            let checksum = text[footer + 1..].trim();
            let expected = u16::from_str_radix(checksum, 16)
                .map_err(|_| TelegramError::MalformedChecksum(checksum.to_string()))?;
            let computed = crc16(&raw[..=footer]);
            if expected != computed {
                return Err(TelegramError::ChecksumMismatch { expected, computed });
            }
        }

        let mut telegram = Telegram::default();
        for line in text[..footer].lines() {
            let line = line.trim();
            if let Some(header) = line.strip_prefix('/') {
                telegram.header = header.to_string();
                continue;
            }
            let Some(open) = line.find('(') else {
                continue;
            };
            let Some(field) = Field::from_obis(&line[..open]) else {
                continue;
            };
            let raw_values: Vec<&str> = line[open..]
                .split(')')
                .filter_map(|part| part.strip_prefix('('))
                .collect();
            let value = decode_value(field, &raw_values)?;
            telegram.insert(field, value);
        }
        Ok(telegram)
    }
}

fn decode_value(field: Field, raw_values: &[&str]) -> Result<Value, TelegramError> {
    let invalid = |value: &str| TelegramError::InvalidValue {
        obis: field.obis().to_string(),
        value: value.to_string(),
    };
    // Gas readings carry the capture time first and the reading last
    let raw = raw_values.last().copied().unwrap_or_default();

    match field {
        Field::Timestamp => parse_timestamp(raw)
            .map(|(time, offset)| Value::Timestamp(time, offset))
            .ok_or_else(|| invalid(raw)),
        Field::DsmrVersion
        | Field::EquipmentId
        | Field::ActiveTariff
        | Field::DeviceType
        | Field::GasEquipmentId => Ok(Value::Text(raw.to_string())),
        _ => {
            let number = raw.split('*').next().unwrap_or_default();
            number
                .parse::<f64>()
                .map(Value::Number)
                .map_err(|_| invalid(raw))
        }
    }
}

/// Parses `YYMMDDhhmmss` with an optional trailing DST flag. Dutch meters run on CET, so
/// `S` (summer) is +02:00 and `W` (winter) is +01:00.
fn parse_timestamp(raw: &str) -> Option<(NaiveDateTime, Option<FixedOffset>)> {
    let (digits, offset) = match raw.as_bytes().last() {
        Some(b'S') => (&raw[..raw.len() - 1], Some(FixedOffset::east_opt(2 * 3600)?)),
        Some(b'W') => (&raw[..raw.len() - 1], Some(FixedOffset::east_opt(3600)?)),
        _ => (raw, None),
    };
    if digits.len() != 12 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let part = |range: std::ops::Range<usize>| digits[range].parse::<u32>().ok();
    let date = NaiveDate::from_ymd_opt(2000 + part(0..2)? as i32, part(2..4)?, part(4..6)?)?;
    let time = date.and_hms_opt(part(6..8)?, part(8..10)?, part(10..12)?)?;
    Some((time, offset))
}

/// CRC16/ARC (reflected polynomial 0xA001, initial value 0) as used by DSMR 4 and 5.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
        }
    }
    crc
}

/// Reassembles complete telegrams out of an arbitrary chunked byte stream.
#[derive(Debug, Default)]
pub struct TelegramBuffer {
    buffer: Vec<u8>,
}

/// Well above the largest DSMR 5 telegram. Beyond this the line settings are likely wrong
/// and no footer is coming.
const MAX_BUFFERED: usize = 16 * 1024;

impl TelegramBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes, discarding the oldest ones past `MAX_BUFFERED`.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > MAX_BUFFERED {
            let excess = self.buffer.len() - MAX_BUFFERED;
            tracing::warn!("no telegram footer in {MAX_BUFFERED} bytes, dropping {excess}");
            self.buffer.drain(..excess);
        }
    }

    /// Removes and returns the next complete telegram, dropping any bytes before its `/`.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let start = match self.buffer.iter().position(|&b| b == b'/') {
            Some(start) => start,
            None => {
                self.buffer.clear();
                return None;
            }
        };
        self.buffer.drain(..start);

        let footer = self.buffer.iter().position(|&b| b == b'!')?;
        let tail = &self.buffer[footer + 1..];
        let end = tail.iter().position(|&b| b == b'\n')?;
        let frame: Vec<u8> = self.buffer.drain(..footer + 1 + end + 1).collect();
        Some(frame)
    }
}
