//! Clock responder: SDX 6-byte timestamp replies.

use chrono::{Datelike, Local, Timelike};

/// 6-byte day/month/year/hour/minute/second layout used by both the time
/// query and PCL directory entries.
pub fn now_sdx() -> [u8; 6] {
    let now = Local::now();
    [
        now.day() as u8,
        now.month() as u8,
        (now.year() % 100) as u8,
        now.hour() as u8,
        now.minute() as u8,
        now.second() as u8,
    ]
}

/// Rotates one byte of the current time into a unit's status `spare`
/// field across successive STATUS polls, cycling offset 0..6. Byte 0 is
/// the 0xff marker that precedes the 6 time bytes in the wire reply, so
/// all seven offsets are distinct.
pub fn rotate_time_byte(offset: &mut u8) -> u8 {
    let time = now_sdx();
    let marked = [0xffu8, time[0], time[1], time[2], time[3], time[4], time[5]];
    let byte = marked[*offset as usize];
    *offset = (*offset + 1) % 7;
    byte
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_cycles_through_seven_offsets() {
        let mut offset = 0u8;
        for _ in 0..7 {
            rotate_time_byte(&mut offset);
        }
        assert_eq!(offset, 0);
    }

    #[test]
    fn rotation_leads_with_the_marker_byte_not_an_aliased_day() {
        let mut offset = 0u8;
        assert_eq!(rotate_time_byte(&mut offset), 0xff);
        // offsets 1..6 walk the real time bytes in order; none of them
        // alias back onto offset 0's marker since day/month/... are all < 0xff.
        let time = now_sdx();
        for expected in time.iter() {
            assert_eq!(rotate_time_byte(&mut offset), *expected);
        }
        assert_eq!(offset, 0);
    }

    #[test]
    fn sdx_time_fields_are_in_range() {
        let t = now_sdx();
        assert!(t[0] >= 1 && t[0] <= 31);
        assert!(t[1] >= 1 && t[1] <= 12);
        assert!(t[3] < 24);
        assert!(t[4] < 60);
        assert!(t[5] < 60);
    }
}
