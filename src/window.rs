use serde::{Deserialize, Serialize};

/// Local wall-clock hours during which a station is polled.
///
/// `0..0` means all day. `start > end` wraps past midnight, so `22..2`
/// covers 22:00 to 01:59. `start == end` (non-zero) covers just that hour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl TimeWindow {
    pub fn new(start_hour: u32, end_hour: u32) -> Self {
        Self {
            start_hour,
            end_hour,
        }
    }

    pub fn is_all_day(&self) -> bool {
        self.start_hour == 0 && self.end_hour == 0
    }

    pub fn contains(&self, hour: u32) -> bool {
        if self.is_all_day() {
            return true;
        }
        if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else if self.start_hour > self.end_hour {
            hour >= self.start_hour || hour < self.end_hour
        } else {
            hour == self.start_hour
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_day_window_is_always_open() {
        let window = TimeWindow::new(0, 0);
        assert!((0..24).all(|h| window.contains(h)));
    }

    #[test]
    fn daytime_window_is_half_open() {
        let window = TimeWindow::new(6, 22);
        assert!(!window.contains(5));
        assert!(window.contains(6));
        assert!(window.contains(21));
        assert!(!window.contains(22));
    }

    #[test]
    fn overnight_window_wraps() {
        let window = TimeWindow::new(22, 2);
        assert!(window.contains(23));
        assert!(window.contains(1));
        assert!(window.contains(22));
        assert!(!window.contains(2));
        assert!(!window.contains(10));
    }

    #[test]
    fn equal_nonzero_hours_cover_one_hour() {
        let window = TimeWindow::new(7, 7);
        let open: Vec<u32> = (0..24).filter(|h| window.contains(*h)).collect();
        assert_eq!(open, vec![7]);
    }
}
