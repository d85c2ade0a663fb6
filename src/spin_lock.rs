// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Adaptive backoff for a contended lock-free retry loop: busy spin -> CPU
// pause hint -> thread yield -> 1ms sleep. Used by `pool::FreeList`'s
// Treiber-stack compare-exchange retries (design §4.2, §9) so a contended
// `push`/`pop` degrades gracefully instead of hammering the cache line.

/// - k < 4:  busy spin (do nothing)
/// - k < 16: CPU pause hint
/// - k < 32: thread yield
/// - k >= 32: sleep 1ms
#[inline]
pub(crate) fn adaptive_yield_pub(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(std::time::Duration::from_millis(1));
        return;
    }
    *k += 1;
}
