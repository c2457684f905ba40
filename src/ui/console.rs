// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Terminal front end: renders UI notifications and asks the user questions.

use std::io::{self, BufRead, Write};

use crate::bluetooth::DiscoveredLock;
use crate::crypto::Checksum;
use crate::events::{Outcome, TaskKind, UiEvent};

/// One line of user-facing text for a notification.
pub fn describe(event: &UiEvent) -> String {
    match event {
        UiEvent::TaskStarted(TaskKind::Unlock) => "Unlocking...".to_string(),
        UiEvent::TaskStarted(TaskKind::KeyExchange) => "Exchanging key...".to_string(),
        UiEvent::TaskFinished { result: Ok(outcome), .. } => match outcome {
            Outcome::DoorUnlocked => "✓ Door unlocked".to_string(),
            Outcome::KeyExchanged { key_number, .. } => {
                format!("✓ Key {} exchanged, waiting for confirmation", key_number)
            }
        },
        UiEvent::TaskFinished {
            task,
            result: Err(e),
        } => format!("✕ {} failed: {}", capitalize(&task.to_string()), e),
        UiEvent::DisplayChecksum(checksum) => format!("Checksum: {}", group(checksum)),
        UiEvent::SelectDevice => "No lock selected".to_string(),
        UiEvent::KeyCommitted { key_number } => format!("● Key {} is now active", key_number),
        UiEvent::KeyDiscarded => "○ Exchanged key discarded".to_string(),
        UiEvent::Rejected(e) => format!("✕ {}", e),
    }
}

/// Checksum split into groups of four hex digits, for reading aloud.
pub fn group(checksum: &Checksum) -> String {
    let hex = checksum.to_string();
    hex.as_bytes()
        .chunks(4)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Ask a yes/no question. Anything but `y`/`yes` counts as no.
pub fn ask_yes_no<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    question: &str,
) -> io::Result<bool> {
    write!(output, "{} [y/N] ", question)?;
    output.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

/// Let the user pick one of the scanned locks.
///
/// Returns `None` when nothing was found or the answer is empty or invalid.
pub fn choose_lock<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    locks: &[DiscoveredLock],
) -> io::Result<Option<DiscoveredLock>> {
    if locks.is_empty() {
        writeln!(output, "No locks found")?;
        return Ok(None);
    }

    for (i, lock) in locks.iter().enumerate() {
        writeln!(output, "  [{}] {}", i + 1, lock)?;
    }
    write!(output, "Select a lock [1-{}]: ", locks.len())?;
    output.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    let choice = answer
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| locks.get(i))
        .cloned();
    Ok(choice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use std::io::Cursor;

    fn lock(address: &str) -> DiscoveredLock {
        DiscoveredLock {
            address: address.to_string(),
            name: None,
            rssi: None,
        }
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            describe(&UiEvent::TaskFinished {
                task: TaskKind::KeyExchange,
                result: Err(TaskError::ProtocolViolation)
            }),
            format!("✕ Key exchange failed: {}", TaskError::ProtocolViolation)
        );
        assert_eq!(
            describe(&UiEvent::KeyCommitted { key_number: 3 }),
            "● Key 3 is now active"
        );
    }

    #[test]
    fn test_checksum_grouping() {
        let checksum = Checksum::from([0x50, 0x46, 0xad, 0xc1, 0xdb, 0xa8, 0x38, 0x86]);
        assert_eq!(group(&checksum), "5046 adc1 dba8 3886");
        assert_eq!(
            describe(&UiEvent::DisplayChecksum(checksum)),
            "Checksum: 5046 adc1 dba8 3886"
        );
    }

    #[test]
    fn test_ask_yes_no() {
        let mut out = Vec::new();
        assert!(ask_yes_no(&mut Cursor::new("y\n"), &mut out, "Match?").unwrap());
        assert!(ask_yes_no(&mut Cursor::new(" YES \n"), &mut out, "Match?").unwrap());
        assert!(!ask_yes_no(&mut Cursor::new("\n"), &mut out, "Match?").unwrap());
        assert!(!ask_yes_no(&mut Cursor::new(""), &mut out, "Match?").unwrap());
        assert!(String::from_utf8(out).unwrap().starts_with("Match? [y/N] "));
    }

    #[test]
    fn test_choose_lock() {
        let locks = vec![lock("AA:AA:AA:AA:AA:AA"), lock("BB:BB:BB:BB:BB:BB")];
        let mut out = Vec::new();

        let chosen = choose_lock(&mut Cursor::new("2\n"), &mut out, &locks).unwrap();
        assert_eq!(chosen, Some(locks[1].clone()));

        for answer in ["0\n", "3\n", "x\n", "\n"] {
            let chosen = choose_lock(&mut Cursor::new(answer), &mut out, &locks).unwrap();
            assert_eq!(chosen, None);
        }
        assert_eq!(choose_lock(&mut Cursor::new("1\n"), &mut out, &[]).unwrap(), None);
    }
}
