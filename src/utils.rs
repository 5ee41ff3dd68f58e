use rand::Rng;
use std::time::Duration;

use crate::se;

pub fn now_seconds() -> crate::Result<i64> {
    Ok(std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| se!("invalid duration {:?}", e))?
        .as_secs() as i64)
}

/// Sleep for a random 0..=max_ms to stay friendly with upstream rate
/// limits. A courtesy, not a correctness requirement.
pub async fn courtesy_delay(max_ms: u64) {
    let ms = rand::thread_rng().gen_range(0..=max_ms);
    async_std::task::sleep(Duration::from_millis(ms)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_seconds_is_sane() {
        // after 2020-01-01, before 2100
        let now = now_seconds().unwrap();
        assert!(now > 1_577_836_800);
        assert!(now < 4_102_444_800);
    }
}
