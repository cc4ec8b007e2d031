//! Extension number allocation.

use std::collections::HashSet;

/// Next free extension on a server.
///
/// One past the highest purely numeric extension already present, or
/// `base` when there is none. Non-numeric numbers are ignored for the
/// maximum but still never handed out twice.
pub fn next_extension<'a, I>(existing: I, base: u32) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut taken = HashSet::new();
    let mut highest: Option<u64> = None;

    for number in existing {
        taken.insert(number.to_string());
        if !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(value) = number.parse::<u64>() {
                highest = Some(highest.map_or(value, |h| h.max(value)));
            }
        }
    }

    let mut candidate = highest.map_or(u64::from(base), |h| h.saturating_add(1));
    while taken.contains(&candidate.to_string()) {
        candidate = candidate.saturating_add(1);
    }
    candidate.to_string()
}
