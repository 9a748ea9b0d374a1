// SPDX-License-Identifier: GPL-3.0-or-later

// Lives in its own test binary: `clear_all` bumps a process-wide generation
// that would race with the unit tests' caches.

use nb_cli::ttl_cache::{TtlCache, clear_all};

#[tokio::test]
async fn clear_all_invalidates_every_cache() {
    let first: TtlCache<u8, u32> = TtlCache::new(None);
    let second: TtlCache<String, String> = TtlCache::new(None);

    first
        .get_or_try_init(1, || async { Ok::<_, ()>(10) })
        .await
        .unwrap();
    second
        .get_or_try_init("k".to_string(), || async { Ok::<_, ()>("v".to_string()) })
        .await
        .unwrap();
    assert_eq!(first.get(&1), Some(10));

    clear_all();

    assert_eq!(first.get(&1), None);
    assert_eq!(second.get(&"k".to_string()), None);

    // Entries from before the clear are dropped on the next lookup.
    first
        .get_or_try_init(2, || async { Ok::<_, ()>(20) })
        .await
        .unwrap();
    assert_eq!(first.len(), 1);

    let recomputed = first.get_or_try_init(1, || async { Ok::<_, ()>(11) }).await;
    assert_eq!(recomputed, Ok(11));
    assert_eq!(first.len(), 2);
}
