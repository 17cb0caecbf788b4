//! When to request the next page.
//!
//! Upstream does not always send `last_page`. Without it the loop keeps going while pages come
//! back full, which costs one extra (empty) request when the total is a multiple of the page
//! size, and stops one page early if upstream silently shrinks its page size.

use padron_adapters::Pagination;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EmptyPage,
    LastPage,
    ShortPage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageDecision {
    Continue,
    Stop(StopReason),
}

/// Decides after receiving `requested_page` with `item_count` records.
pub fn next_page_decision(
    requested_page: u32,
    pagination: Option<&Pagination>,
    item_count: usize,
    requested_page_size: u32,
) -> PageDecision {
    if item_count == 0 {
        return PageDecision::Stop(StopReason::EmptyPage);
    }

    let pagination = pagination.cloned().unwrap_or_default();
    if let Some(last_page) = pagination.last_page {
        // A stale `current_page` must not pin the loop on one page number.
        let current = pagination.current_page.unwrap_or(requested_page).max(requested_page);
        return if current < last_page {
            PageDecision::Continue
        } else {
            PageDecision::Stop(StopReason::LastPage)
        };
    }

    let effective_page_size = pagination
        .per_page
        .filter(|size| *size > 0)
        .unwrap_or(requested_page_size) as usize;
    if item_count >= effective_page_size {
        PageDecision::Continue
    } else {
        PageDecision::Stop(StopReason::ShortPage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(current: Option<u32>, last: Option<u32>, per_page: Option<u32>) -> Pagination {
        Pagination {
            current_page: current,
            last_page: last,
            per_page,
        }
    }

    #[test]
    fn empty_page_always_stops() {
        let pagination = meta(Some(1), Some(9), Some(2));
        assert_eq!(
            next_page_decision(1, Some(&pagination), 0, 2),
            PageDecision::Stop(StopReason::EmptyPage)
        );
    }

    #[test]
    fn explicit_last_page_wins_over_item_count() {
        let pagination = meta(Some(2), Some(3), Some(2));
        assert_eq!(next_page_decision(2, Some(&pagination), 1, 2), PageDecision::Continue);

        let pagination = meta(Some(3), Some(3), Some(2));
        assert_eq!(
            next_page_decision(3, Some(&pagination), 2, 2),
            PageDecision::Stop(StopReason::LastPage)
        );
    }

    #[test]
    fn stale_current_page_does_not_loop_forever() {
        let pagination = meta(Some(1), Some(3), None);
        assert_eq!(
            next_page_decision(3, Some(&pagination), 2, 2),
            PageDecision::Stop(StopReason::LastPage)
        );
    }

    #[test]
    fn missing_last_page_falls_back_to_full_page_heuristic() {
        assert_eq!(next_page_decision(1, None, 500, 500), PageDecision::Continue);
        assert_eq!(
            next_page_decision(1, None, 499, 500),
            PageDecision::Stop(StopReason::ShortPage)
        );

        // Upstream-reported page size overrides the requested one.
        let pagination = meta(Some(1), None, Some(100));
        assert_eq!(next_page_decision(1, Some(&pagination), 100, 500), PageDecision::Continue);
        let pagination = meta(None, None, Some(0));
        assert_eq!(
            next_page_decision(1, Some(&pagination), 3, 5),
            PageDecision::Stop(StopReason::ShortPage)
        );
    }
}
