// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use std::sync::{Arc, Mutex, atomic::{AtomicBool, AtomicUsize, Ordering}};

type Waker = Arc<dyn Fn() + Send + Sync>;

/// A cancellation signal for blocking waits.
///
/// Threads parked on a condition variable register a waker for the duration of the
/// wait; `cancel` invokes every registered waker once.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<TokenInner>);

#[derive(Default)]
struct TokenInner {
	cancelled: AtomicBool,
	next_id:   AtomicUsize,
	wakers:    Mutex<Vec<(usize, Waker)>>
}

impl CancellationToken {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.cancelled.load(Ordering::Acquire)
	}

	pub fn cancel(&self) {
		if self.0.cancelled.swap(true, Ordering::AcqRel) {
			return;
		}

		let wakers = match self.0.wakers.lock() {
			Ok(mut wakers) => std::mem::take(&mut *wakers),
			Err(_)         => return
		};

		for (_, waker) in wakers {
			waker();
		}
	}

	/// Registers `waker` until the returned guard is dropped. The flag is set before
	/// any waker runs, so a waiter that checks `is_cancelled` under its own lock and a
	/// waker that takes that lock before notifying cannot miss each other.
	pub(crate) fn register(&self, waker: impl Fn() + Send + Sync + 'static) -> WakerGuard {
		let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
		if let Ok(mut wakers) = self.0.wakers.lock() {
			wakers.push((id, Arc::new(waker)));
		}
		WakerGuard { token: self.clone(), id }
	}
}

impl std::fmt::Debug for CancellationToken {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("CancellationToken")
			.field("cancelled", &self.is_cancelled())
			.finish()
	}
}

pub(crate) struct WakerGuard {
	token: CancellationToken,
	id:    usize
}

impl Drop for WakerGuard {
	fn drop(&mut self) {
		if let Ok(mut wakers) = self.token.0.wakers.lock() {
			wakers.retain(|(id, _)| *id != self.id);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn wakers_run_once() {
		let token = CancellationToken::new();
		let count = Arc::new(AtomicUsize::new(0));
		let count_ = count.clone();
		let _guard = token.register(move || { count_.fetch_add(1, Ordering::SeqCst); });

		assert!(!token.is_cancelled());
		token.cancel();
		token.cancel();
		assert!(token.is_cancelled());
		assert_eq!(count.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn dropped_guard_unregisters() {
		let token = CancellationToken::new();
		let count = Arc::new(AtomicUsize::new(0));
		let count_ = count.clone();
		drop(token.register(move || { count_.fetch_add(1, Ordering::SeqCst); }));

		token.cancel();
		assert_eq!(count.load(Ordering::SeqCst), 0);
	}
}
