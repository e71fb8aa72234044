//! Index arithmetic for paged lists. `total` always comes from a fresh query;
//! a stored index is never trusted.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Prev,
    Next,
}

/// Clamps a stored index into `[0, total - 1]`. `None` when the list is empty.
pub fn clamp(stored: Option<usize>, total: usize) -> Option<usize> {
    if total == 0 {
        return None;
    }
    Some(stored.unwrap_or(0).min(total - 1))
}

/// Moves one step with wrap-around. The stored index is clamped first so a
/// list that shrank since the last press still lands in range.
pub fn step(stored: Option<usize>, total: usize, direction: Direction) -> Option<usize> {
    let index = clamp(stored, total)?;
    let next = match direction {
        Direction::Prev => (index + total - 1) % total,
        Direction::Next => (index + 1) % total,
    };
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_in_both_directions() {
        assert_eq!(step(Some(2), 3, Direction::Next), Some(0));
        assert_eq!(step(Some(0), 3, Direction::Prev), Some(2));
        assert_eq!(step(None, 3, Direction::Next), Some(1));
    }

    #[test]
    fn empty_list_has_no_position() {
        assert_eq!(clamp(Some(4), 0), None);
        assert_eq!(step(Some(4), 0, Direction::Next), None);
    }

    #[test]
    fn shrinking_list_never_goes_out_of_range() {
        let mut index = Some(4);
        for total in [5, 4, 3, 2, 1] {
            index = step(index, total, Direction::Next);
            let i = index.unwrap();
            assert!(i < total, "index {} out of range for {}", i, total);
        }
        assert_eq!(clamp(Some(9), 2), Some(1));
    }

    #[test]
    fn n_steps_equal_modular_offset() {
        let total = 7;
        let start = 3;
        let mut index = Some(start);
        for n in 1..=20usize {
            index = step(index, total, Direction::Prev);
            assert_eq!(index, Some((start + total * n - n) % total));
        }
    }
}
