/*
 * Copyright 2025 Michael Krolikowski
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::{sync::Arc, time::Duration};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Single-slot lock serialising update sessions.
#[derive(Clone, Default)]
pub struct UpdateLock {
    slot: Arc<Mutex<()>>,
}

/// Held for the lifetime of a session; dropping it frees the slot.
pub struct UpdateGuard {
    _slot: OwnedMutexGuard<()>,
}

impl UpdateLock {
    pub fn try_acquire(&self) -> Option<UpdateGuard> {
        self.slot
            .clone()
            .try_lock_owned()
            .ok()
            .map(|slot| UpdateGuard { _slot: slot })
    }

    pub async fn acquire(&self) -> UpdateGuard {
        UpdateGuard {
            _slot: self.slot.clone().lock_owned().await,
        }
    }

    /// `None` when the slot did not free up within `limit`.
    pub async fn acquire_within(&self, limit: Option<Duration>) -> Option<UpdateGuard> {
        match limit {
            Some(limit) => tokio::time::timeout(limit, self.acquire()).await.ok(),
            None => Some(self.acquire().await),
        }
    }

    pub fn is_free(&self) -> bool {
        self.slot.try_lock().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::UpdateLock;

    #[test]
    fn single_slot() {
        let lock = UpdateLock::default();
        let guard = lock.try_acquire().unwrap();
        assert!(lock.try_acquire().is_none());
        assert!(!lock.is_free());
        drop(guard);
        assert!(lock.is_free());
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let lock = UpdateLock::default();
        let guard = lock.try_acquire().unwrap();
        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        let _guard = waiter.await.unwrap();
        assert!(!lock.is_free());
    }

    #[tokio::test]
    async fn bounded_wait() {
        let lock = UpdateLock::default();
        let _guard = lock.try_acquire().unwrap();
        assert!(
            lock.acquire_within(Some(Duration::from_millis(20)))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn released_when_holder_panics() {
        let lock = UpdateLock::default();
        let task = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let _guard = lock.acquire().await;
                panic!("session blew up");
            })
        };
        assert!(task.await.is_err());
        assert!(lock.is_free());
    }
}
