//! Parsing of FTP directory listings.
//!
//! `LIST` output is not standardized; the two formats seen in practice are the unix `ls -l`
//! layout and the DOS/IIS layout. `MLSD` output (RFC 3659) is machine readable and preferred
//! whenever the server supports it.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    /// Size in bytes as reported by the server.
    pub size: u64,
    pub modified: Option<NaiveDateTime>,
    pub is_dir: bool,
    /// Permission string as reported by the server, empty if it reports none.
    pub mode: String,
}

impl RemoteEntry {
    pub fn file(name: &str, size: u64) -> Self {
        Self {
            name: name.to_string(),
            size,
            modified: None,
            is_dir: false,
            mode: String::new(),
        }
    }
}

/// Splits off the first `count` whitespace separated fields, returning them and the rest of the
/// line with leading whitespace removed.
fn split_fields(line: &str, count: usize) -> Option<(Vec<&str>, &str)> {
    let mut fields = Vec::with_capacity(count);
    let mut rest = line.trim_start();
    while fields.len() < count {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Some((fields, rest))
}

fn month(text: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let text = text.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|month| *month == text)
        .and_then(|index| u32::try_from(index + 1).ok())
}

// "Mar  7 10:15" carries no year: it is within the last six months, so it is this year unless
// that would put it in the future
fn unix_timestamp(
    month_text: &str,
    day_text: &str,
    time_or_year: &str,
    today: NaiveDate,
) -> Option<NaiveDateTime> {
    let month = month(month_text)?;
    let day: u32 = day_text.parse().ok()?;
    if let Some((hour, minute)) = time_or_year.split_once(':') {
        let time = NaiveTime::from_hms_opt(hour.parse().ok()?, minute.parse().ok()?, 0)?;
        let this_year = NaiveDate::from_ymd_opt(today.year(), month, day)?;
        let date = if this_year > today + chrono::Days::new(1) {
            NaiveDate::from_ymd_opt(today.year() - 1, month, day)?
        } else {
            this_year
        };
        return Some(date.and_time(time));
    }
    let year: i32 = time_or_year.parse().ok()?;
    Some(NaiveDate::from_ymd_opt(year, month, day)?.and_time(NaiveTime::MIN))
}

fn parse_unix_line(line: &str, today: NaiveDate) -> Option<RemoteEntry> {
    let mode = line.split_whitespace().next()?;
    let kind = mode.chars().next()?;
    if !matches!(kind, '-' | 'd' | 'l' | 'p' | 's' | 'b' | 'c') || mode.len() < 10 {
        return None;
    }
    // "mode links owner group size month day time name", some servers omit the group
    let (size, modified, name) = match split_fields(line, 8) {
        Some((fields, name)) if fields[4].parse::<u64>().is_ok() && month(fields[5]).is_some() => (
            fields[4].parse::<u64>().ok()?,
            unix_timestamp(fields[5], fields[6], fields[7], today),
            name,
        ),
        _ => {
            let (fields, name) = split_fields(line, 7)?;
            (
                fields[3].parse::<u64>().ok()?,
                unix_timestamp(fields[4], fields[5], fields[6], today),
                name,
            )
        }
    };
    let name = match (kind, name.split_once(" -> ")) {
        ('l', Some((link, _target))) => link,
        _ => name,
    };
    Some(RemoteEntry {
        name: name.to_string(),
        size,
        modified,
        is_dir: kind == 'd',
        mode: mode.to_string(),
    })
}

fn parse_dos_line(line: &str) -> Option<RemoteEntry> {
    // "03-07-24  10:15AM       1000 a.csv" or "03-07-24  10:15AM  <DIR>  reports"
    let (fields, name) = split_fields(line, 3)?;
    let date = NaiveDate::parse_from_str(fields[0], "%m-%d-%y")
        .or_else(|_| NaiveDate::parse_from_str(fields[0], "%m-%d-%Y"))
        .ok()?;
    let time = NaiveTime::parse_from_str(fields[1], "%I:%M%p")
        .or_else(|_| NaiveTime::parse_from_str(fields[1], "%H:%M"))
        .ok()?;
    let (size, is_dir) = if fields[2].eq_ignore_ascii_case("<DIR>") {
        (0, true)
    } else {
        (fields[2].parse().ok()?, false)
    };
    Some(RemoteEntry {
        name: name.to_string(),
        size,
        modified: Some(date.and_time(time)),
        is_dir,
        mode: String::new(),
    })
}

/// Parses one line of `LIST` output, `None` for lines that are not entries (e.g. `total 8`).
pub fn parse_list_line(line: &str, today: NaiveDate) -> Option<RemoteEntry> {
    let line = line.trim_end_matches(['\r', '\n']);
    let entry = parse_unix_line(line, today).or_else(|| parse_dos_line(line))?;
    if entry.name.is_empty() || entry.name == "." || entry.name == ".." {
        return None;
    }
    Some(entry)
}

fn parse_mlsd_modify(value: &str) -> Option<NaiveDateTime> {
    let seconds = value.split('.').next()?;
    NaiveDateTime::parse_from_str(seconds, "%Y%m%d%H%M%S").ok()
}

/// Parses one line of `MLSD` output: `fact=value;fact=value; name`.
pub fn parse_mlsd_line(line: &str) -> Option<RemoteEntry> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (facts, name) = line.split_once(' ')?;
    let mut entry = RemoteEntry::file(name, 0);
    for fact in facts.split(';').filter(|fact| !fact.is_empty()) {
        let (key, value) = fact.split_once('=')?;
        match key.to_ascii_lowercase().as_str() {
            "type" => match value.to_ascii_lowercase().as_str() {
                "file" => entry.is_dir = false,
                "dir" => entry.is_dir = true,
                // cdir, pdir and OS specific types are never downloadable
                _ => return None,
            },
            "size" => entry.size = value.parse().ok()?,
            "modify" => entry.modified = parse_mlsd_modify(value),
            "unix.mode" => entry.mode = value.to_string(),
            "perm" if entry.mode.is_empty() => entry.mode = value.to_string(),
            _ => {}
        }
    }
    if entry.name.is_empty() || entry.name == "." || entry.name == ".." {
        return None;
    }
    Some(entry)
}

/// Parses a whole listing, skipping lines that do not describe an entry.
pub fn parse_listing(text: &str, mlsd: bool, today: NaiveDate) -> Vec<RemoteEntry> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let entry = if mlsd {
                parse_mlsd_line(line)
            } else {
                parse_list_line(line, today)
            };
            if entry.is_none() {
                tracing::trace!("skipping listing line {:?}", line);
            }
            entry
        })
        .collect()
}
