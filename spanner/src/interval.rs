use std::fmt;
use std::str::FromStr;

const NANOS_PER_SECOND: i128 = 1_000_000_000;
const NANOS_PER_MINUTE: i128 = 60 * NANOS_PER_SECOND;
const NANOS_PER_HOUR: i128 = 60 * NANOS_PER_MINUTE;

const MAX_MONTHS: i128 = 10_000 * 12;
const MAX_DAYS: i128 = 3_660_000;
const MAX_HOURS: i128 = 87_840_000;
const MAX_NANOS: i128 = MAX_HOURS * NANOS_PER_HOUR;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid interval format: {0}")]
    InvalidFormat(String),
    #[error("interval out of range: {0}")]
    OutOfRange(String),
}

/// INTERVAL value. The three parts are independent and each carries its own sign.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Interval {
    months: i32,
    days: i32,
    nanos: i128,
}

impl Interval {
    pub fn new(months: i32, days: i32, nanos: i128) -> Result<Self, Error> {
        if (months as i128).abs() > MAX_MONTHS {
            return Err(Error::OutOfRange(format!("months={months}")));
        }
        if (days as i128).abs() > MAX_DAYS {
            return Err(Error::OutOfRange(format!("days={days}")));
        }
        if nanos.abs() > MAX_NANOS {
            return Err(Error::OutOfRange(format!("nanos={nanos}")));
        }
        Ok(Self { months, days, nanos })
    }

    pub fn from_months(months: i32) -> Result<Self, Error> {
        Self::new(months, 0, 0)
    }

    pub fn from_days(days: i32) -> Result<Self, Error> {
        Self::new(0, days, 0)
    }

    pub fn from_nanos(nanos: i128) -> Result<Self, Error> {
        Self::new(0, 0, nanos)
    }

    pub fn months(&self) -> i32 {
        self.months
    }

    pub fn days(&self) -> i32 {
        self.days
    }

    pub fn nanos(&self) -> i128 {
        self.nanos
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.months == 0 && self.days == 0 && self.nanos == 0 {
            return f.write_str("P0Y");
        }
        f.write_str("P")?;
        let years = self.months / 12;
        let months = self.months % 12;
        if years != 0 {
            write!(f, "{years}Y")?;
        }
        if months != 0 {
            write!(f, "{months}M")?;
        }
        if self.days != 0 {
            write!(f, "{}D", self.days)?;
        }
        if self.nanos == 0 {
            return Ok(());
        }
        f.write_str("T")?;
        let hours = self.nanos / NANOS_PER_HOUR;
        let mut rest = self.nanos % NANOS_PER_HOUR;
        let minutes = rest / NANOS_PER_MINUTE;
        rest %= NANOS_PER_MINUTE;
        let seconds = rest / NANOS_PER_SECOND;
        let fraction = (rest % NANOS_PER_SECOND).abs();
        if hours != 0 {
            write!(f, "{hours}H")?;
        }
        if minutes != 0 {
            write!(f, "{minutes}M")?;
        }
        if seconds == 0 && fraction == 0 {
            return Ok(());
        }
        // "-0.5S": the sign would be lost on a zero seconds part
        if self.nanos < 0 && seconds == 0 {
            f.write_str("-")?;
        }
        write!(f, "{seconds}")?;
        if fraction != 0 {
            if fraction % 1_000_000 == 0 {
                write!(f, ".{:03}", fraction / 1_000_000)?;
            } else if fraction % 1_000 == 0 {
                write!(f, ".{:06}", fraction / 1_000)?;
            } else {
                write!(f, ".{fraction:09}")?;
            }
        }
        f.write_str("S")
    }
}

struct Component {
    value: i128,
    negative: bool,
    fraction: Option<i128>,
    unit: char,
}

fn next_component(input: &str, allow_fraction: bool) -> Result<(Component, &str), Error> {
    let invalid = || Error::InvalidFormat(input.to_string());
    let mut chars = input.char_indices().peekable();
    let mut negative = false;
    if let Some((_, c)) = chars.peek() {
        if *c == '-' || *c == '+' {
            negative = *c == '-';
            chars.next();
        }
    }
    let digits_start = chars.peek().map(|(i, _)| *i).ok_or_else(invalid)?;
    let mut digits_end = digits_start;
    while let Some((i, c)) = chars.peek() {
        if !c.is_ascii_digit() {
            break;
        }
        digits_end = *i + 1;
        chars.next();
    }
    if digits_end == digits_start {
        return Err(invalid());
    }
    let magnitude: i128 = input[digits_start..digits_end]
        .parse()
        .map_err(|_| Error::OutOfRange(input.to_string()))?;
    if magnitude > MAX_NANOS {
        return Err(Error::OutOfRange(input.to_string()));
    }

    let mut fraction = None;
    if let Some((_, c)) = chars.peek() {
        if *c == '.' || *c == ',' {
            if !allow_fraction {
                return Err(invalid());
            }
            chars.next();
            let start = chars.peek().map(|(i, _)| *i).ok_or_else(invalid)?;
            let mut end = start;
            while let Some((i, c)) = chars.peek() {
                if !c.is_ascii_digit() {
                    break;
                }
                end = *i + 1;
                chars.next();
            }
            let text = &input[start..end];
            if text.is_empty() || text.len() > 9 {
                return Err(invalid());
            }
            let scaled: i128 = format!("{text:0<9}").parse().map_err(|_| invalid())?;
            fraction = Some(scaled);
        }
    }
    let (index, unit) = chars.next().ok_or_else(invalid)?;
    let value = if negative { -magnitude } else { magnitude };
    Ok((
        Component {
            value,
            negative,
            fraction,
            unit,
        },
        &input[index + unit.len_utf8()..],
    ))
}

impl FromStr for Interval {
    type Err = Error;

    /// Parses an ISO-8601 duration such as `P1Y2M3DT12H34M56.789S`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidFormat(s.to_string());
        let body = s.strip_prefix('P').ok_or_else(invalid)?;
        if body.is_empty() {
            return Err(invalid());
        }
        let (date_part, time_part) = match body.split_once('T') {
            Some((d, t)) if t.is_empty() => return Err(Error::InvalidFormat(format!("{d}T"))),
            Some((d, t)) => (d, Some(t)),
            None => (body, None),
        };

        let mut months: i128 = 0;
        let mut days: i128 = 0;
        let mut nanos: i128 = 0;

        let mut rest = date_part;
        let mut order = 0;
        while !rest.is_empty() {
            let (c, next) = next_component(rest, false)?;
            let rank = match c.unit {
                'Y' => 1,
                'M' => 2,
                'W' => 3,
                'D' => 4,
                _ => return Err(invalid()),
            };
            if rank <= order {
                return Err(invalid());
            }
            order = rank;
            match c.unit {
                'Y' => months += c.value * 12,
                'M' => months += c.value,
                'W' => days += c.value * 7,
                _ => days += c.value,
            }
            rest = next;
        }

        if let Some(time_part) = time_part {
            let mut rest = time_part;
            let mut order = 0;
            while !rest.is_empty() {
                let (c, next) = next_component(rest, true)?;
                let rank = match c.unit {
                    'H' => 1,
                    'M' => 2,
                    'S' => 3,
                    _ => return Err(invalid()),
                };
                if rank <= order || (c.fraction.is_some() && c.unit != 'S') {
                    return Err(invalid());
                }
                order = rank;
                match c.unit {
                    'H' => nanos += c.value * NANOS_PER_HOUR,
                    'M' => nanos += c.value * NANOS_PER_MINUTE,
                    _ => {
                        nanos += c.value * NANOS_PER_SECOND;
                        if let Some(fraction) = c.fraction {
                            nanos += if c.negative { -fraction } else { fraction };
                        }
                    }
                }
                rest = next;
            }
        }

        if months.abs() > MAX_MONTHS || days.abs() > MAX_DAYS {
            return Err(Error::OutOfRange(s.to_string()));
        }
        Interval::new(months as i32, days as i32, nanos)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use crate::interval::{Error, Interval, NANOS_PER_HOUR, NANOS_PER_MINUTE, NANOS_PER_SECOND};

    #[test]
    fn test_format() {
        let iv = Interval::new(14, 3, 12 * NANOS_PER_HOUR + 34 * NANOS_PER_MINUTE + 56_789_000_000).unwrap();
        assert_eq!(iv.to_string(), "P1Y2M3DT12H34M56.789S");
        assert_eq!(Interval::default().to_string(), "P0Y");
        assert_eq!(Interval::from_months(-13).unwrap().to_string(), "P-1Y-1M");
        assert_eq!(Interval::from_nanos(-NANOS_PER_SECOND / 2).unwrap().to_string(), "PT-0.500S");
        assert_eq!(Interval::from_nanos(1_500).unwrap().to_string(), "PT0.000001500S");
        assert_eq!(Interval::from_nanos(1_000).unwrap().to_string(), "PT0.000001S");
        assert_eq!(
            Interval::from_nanos(-(90 * NANOS_PER_MINUTE)).unwrap().to_string(),
            "PT-1H-30M"
        );
    }

    #[test]
    fn test_parse() {
        let iv = Interval::from_str("P1Y2M3DT12H34M56.789S").unwrap();
        assert_eq!(iv.months(), 14);
        assert_eq!(iv.days(), 3);
        assert_eq!(iv.nanos(), 12 * NANOS_PER_HOUR + 34 * NANOS_PER_MINUTE + 56_789_000_000);

        let iv = Interval::from_str("P-1Y2M-3DT-4H5M-6.5S").unwrap();
        assert_eq!(iv.months(), -10);
        assert_eq!(iv.days(), -3);
        assert_eq!(
            iv.nanos(),
            -4 * NANOS_PER_HOUR + 5 * NANOS_PER_MINUTE - 6 * NANOS_PER_SECOND - 500_000_000
        );

        assert_eq!(Interval::from_str("P2W").unwrap().days(), 14);
        assert_eq!(Interval::from_str("PT0,5S").unwrap().nanos(), 500_000_000);
        assert_eq!(Interval::from_str("P0Y").unwrap(), Interval::default());
    }

    #[test]
    fn test_parse_invalid() {
        for text in ["", "P", "1Y", "PT", "P1H", "PT1D", "P1M1Y", "P1.5Y", "PT1.5H", "PT1.0000000001S", "PxY"] {
            assert!(
                matches!(Interval::from_str(text), Err(Error::InvalidFormat(_))),
                "{text} must be rejected"
            );
        }
    }

    #[test]
    fn test_extremes() {
        let max = Interval::from_str("PT87840000H").unwrap();
        assert_eq!(max.nanos(), 87_840_000 * NANOS_PER_HOUR);
        assert_eq!(max.to_string(), "PT87840000H");
        let min = Interval::from_str("PT-87840000H").unwrap();
        assert_eq!(min.to_string(), "PT-87840000H");
        assert!(matches!(Interval::from_str("PT87840001H"), Err(Error::OutOfRange(_))));
        assert!(matches!(Interval::from_str("P10001Y"), Err(Error::OutOfRange(_))));
        assert!(Interval::from_str("P10000Y").is_ok());
        assert!(matches!(Interval::from_days(3_660_001), Err(Error::OutOfRange(_))));
    }

    #[test]
    fn test_round_trip() {
        for text in [
            "P0Y",
            "P1Y",
            "P-3M",
            "P5D",
            "PT1H",
            "PT-0.000000001S",
            "P1Y2M3DT4H5M6.123456S",
            "P-10000YT-87840000H",
        ] {
            let iv = Interval::from_str(text).unwrap();
            assert_eq!(iv.to_string(), text);
            assert_eq!(Interval::from_str(&iv.to_string()).unwrap(), iv);
        }
    }
}
