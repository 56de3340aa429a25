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

//! An in-memory network of fake servers that answer heartbeats with JSON replies.

use {
	crate::{
		apm::EventEmitter,
		common::{Result, Error, ServerAddress, ConnectionPoolOptions},
		pool::{ConnectionPool, Connection, IdGenerator},
		wire::{self, Transport, Connector, Authenticator, HelloCodec, HelloReply}
	},
	std::{
		sync::{Arc, Mutex, atomic::{AtomicBool, Ordering}},
		collections::{HashMap, VecDeque},
		io,
		time::Duration
	}
};

#[derive(Debug, Default)]
struct Host {
	reply:          Option<HelloReply>,
	down:           bool,
	open:           usize,
	opened:         usize,
	connect_delay:  Duration,
	connecting:     usize,
	max_connecting: usize
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MockNetwork(Arc<NetworkInner>);

#[derive(Debug, Default)]
pub(crate) struct NetworkInner {
	hosts:     Mutex<HashMap<ServerAddress, Host>>,
	fail_auth: AtomicBool,
	ids:       IdGenerator
}

fn address(s: &str) -> ServerAddress {
	s.parse().unwrap()
}

impl MockNetwork {
	pub(crate) fn new() -> Self {
		Self::default()
	}

	fn with_host<T>(&self, host: &ServerAddress, f: impl FnOnce(&mut Host) -> T) -> T {
		f(self.0.hosts.lock().unwrap().entry(host.clone()).or_default())
	}

	pub(crate) fn set_reply(&self, host: &str, reply: HelloReply) {
		self.with_host(&address(host), |host| host.reply = Some(reply));
	}

	/// A host that is down refuses connections and breaks the open ones.
	pub(crate) fn set_down(&self, host: &str, down: bool) {
		self.with_host(&address(host), |host| host.down = down);
	}

	/// Makes every connect to `host` take `delay`.
	pub(crate) fn set_connect_delay(&self, host: &str, delay: Duration) {
		self.with_host(&address(host), |host| host.connect_delay = delay);
	}

	/// The most connects to `host` that were in progress at the same time.
	pub(crate) fn max_connecting(&self, host: &str) -> usize {
		self.with_host(&address(host), |host| host.max_connecting)
	}

	pub(crate) fn fail_auth(&self, fail: bool) {
		self.0.fail_auth.store(fail, Ordering::SeqCst);
	}

	/// Currently open transports to `host`.
	pub(crate) fn open(&self, host: &str) -> usize {
		self.with_host(&address(host), |host| host.open)
	}

	/// Transports ever opened to `host`.
	pub(crate) fn opened(&self, host: &str) -> usize {
		self.with_host(&address(host), |host| host.opened)
	}

	pub(crate) fn codec(&self) -> Arc<dyn HelloCodec> {
		Arc::new(JsonCodec)
	}

	pub(crate) fn pool(&self, host: &str, options: ConnectionPoolOptions) -> ConnectionPool {
		ConnectionPool::new(address(host), options, Arc::new(self.clone()),
			Some(Arc::new(self.clone())), EventEmitter::new(), self.0.ids.clone()).unwrap()
	}
}

impl Connector for MockNetwork {
	fn connect(&self, address: &ServerAddress, _timeout: Duration) -> Result<Box<dyn Transport>> {
		let delay = self.with_host(address, |host| {
			host.connecting += 1;
			host.max_connecting = host.max_connecting.max(host.connecting);
			host.connect_delay
		});
		std::thread::sleep(delay);

		self.with_host(address, |host| -> Result<()> {
			host.connecting -= 1;
			if host.down {
				return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused").into());
			}
			host.open += 1;
			host.opened += 1;
			Ok(())
		})?;

		Ok(Box::new(MockTransport {
			network: self.clone(),
			address: address.clone(),
			inbox:   VecDeque::new()
		}))
	}
}

impl Authenticator for MockNetwork {
	fn authenticate(&self, _connection: &mut Connection) -> Result<()> {
		if self.0.fail_auth.load(Ordering::SeqCst) {
			Err(Error::Auth("bad credentials".to_string()))
		} else {
			Ok(())
		}
	}
}

#[derive(Debug)]
struct MockTransport {
	network: MockNetwork,
	address: ServerAddress,
	inbox:   VecDeque<Vec<u8>>
}

impl Transport for MockTransport {
	fn send(&mut self, _message: &[u8]) -> Result<()> {
		let reply = self.network.with_host(&self.address, |host| if host.down {
			None
		} else {
			Some(host.reply.clone().unwrap_or_else(|| HelloReply {
				max_wire_version: wire::MAX_WIRE_VERSION,
				..HelloReply::default()
			}))
		});

		match reply {
			Some(reply) => {
				self.inbox.push_back(serde_json::to_vec(&reply).map_err(|e| Error::InvalidReply(e.to_string()))?);
				Ok(())
			}
			None => Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset").into())
		}
	}

	fn receive(&mut self) -> Result<Vec<u8>> {
		self.inbox.pop_front()
			.ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "nothing to receive").into())
	}
}

impl Drop for MockTransport {
	fn drop(&mut self) {
		if let Ok(mut hosts) = self.network.0.hosts.lock() {
			if let Some(host) = hosts.get_mut(&self.address) {
				host.open -= 1;
			}
		}
	}
}

/// Heartbeat replies as plain JSON documents.
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct JsonCodec;

impl HelloCodec for JsonCodec {
	fn encode_hello(&self, request_id: i32) -> Result<Vec<u8>> {
		Ok(format!(r#"{{"hello":1,"requestId":{}}}"#, request_id).into_bytes())
	}

	fn decode_hello(&self, _request_id: i32, reply: &[u8]) -> Result<HelloReply> {
		serde_json::from_slice(reply).map_err(|e| Error::InvalidReply(e.to_string()))
	}
}
