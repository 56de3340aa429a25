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

//! The seams to the rest of the driver. Nothing in here knows what a command looks
//! like on the wire; encoding is left to the `HelloCodec` and whoever uses a
//! checked out connection.

use {
	crate::{
		common::{Result, Error, ServerAddress, TagSet},
		description::TopologyVersion,
		oid::ObjectId,
		pool::Connection
	},
	std::{io::{self, Read, Write}, net::{TcpStream, ToSocketAddrs}, time::Duration},
	serde::{Serialize, Deserialize}
};

pub const MIN_WIRE_VERSION: i32 = 6;
pub const MAX_WIRE_VERSION: i32 = 21;
/// Servers from this version on keep their pools when they step down.
pub const KEEP_POOL_ON_STEP_DOWN_WIRE_VERSION: i32 = 8;
/// Upper bound of a single message, see `maxMessageSizeBytes`.
pub const MAX_MESSAGE_SIZE: usize = 48_000_000;

/// A single established byte stream to a server.
pub trait Transport: Send + std::fmt::Debug {
	fn send(&mut self, message: &[u8]) -> Result<()>;

	/// Receives exactly one message.
	fn receive(&mut self) -> Result<Vec<u8>>;

	/// Bounds how long `receive` may block, `None` blocks indefinitely.
	fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> Result<()> {
		Ok(())
	}
}

/// Opens transports, e.g. plain TCP or TLS.
pub trait Connector: Send + Sync {
	fn connect(&self, address: &ServerAddress, timeout: Duration) -> Result<Box<dyn Transport>>;
}

/// Runs once on every new pooled connection before it is handed out.
pub trait Authenticator: Send + Sync {
	fn authenticate(&self, connection: &mut Connection) -> Result<()>;
}

/// Encodes heartbeat requests and decodes their replies.
pub trait HelloCodec: Send + Sync {
	fn encode_hello(&self, request_id: i32) -> Result<Vec<u8>>;

	fn decode_hello(&self, request_id: i32, reply: &[u8]) -> Result<HelloReply>;
}

/// The fields of a `hello` reply that matter for discovery and monitoring.
///
/// see https://github.com/mongodb/specifications/blob/master/source/mongodb-handshake/handshake.rst
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HelloReply {
	#[serde(alias = "ismaster")]
	pub is_writable_primary:             bool,
	pub secondary:                       bool,
	pub arbiter_only:                    bool,
	pub hidden:                          bool,
	pub msg:                             Option<String>,
	#[serde(rename = "isreplicaset")]
	pub is_replica_set:                  bool,
	pub set_name:                        Option<String>,
	pub set_version:                     Option<i32>,
	pub election_id:                     Option<ObjectId>,
	pub primary:                         Option<ServerAddress>,
	pub me:                              Option<ServerAddress>,
	pub hosts:                           Vec<ServerAddress>,
	pub passives:                        Vec<ServerAddress>,
	pub arbiters:                        Vec<ServerAddress>,
	pub tags:                            TagSet,
	pub min_wire_version:                i32,
	pub max_wire_version:                i32,
	pub last_write:                      Option<LastWrite>,
	pub topology_version:                Option<TopologyVersion>,
	pub logical_session_timeout_minutes: Option<i64>
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastWrite {
	/// Milliseconds since the unix epoch.
	pub last_write_date: i64
}

/// Plain TCP, messages are framed by their little endian `messageLength` header.
#[derive(Debug, Default, Copy, Clone)]
pub struct TcpConnector;

impl Connector for TcpConnector {
	fn connect(&self, address: &ServerAddress, timeout: Duration) -> Result<Box<dyn Transport>> {
		let mut last_err = None;
		for addr in (address.host.as_str(), address.port).to_socket_addrs()? {
			match TcpStream::connect_timeout(&addr, timeout) {
				Ok(stream) => {
					stream.set_nodelay(true)?;
					return Ok(Box::new(TcpTransport(stream)));
				}
				Err(e) => last_err = Some(e)
			}
		}

		Err(last_err.unwrap_or_else(|| io::Error::new(
			io::ErrorKind::NotFound, format!("`{}` did not resolve to any address", address))).into())
	}
}

#[derive(Debug)]
pub struct TcpTransport(TcpStream);

impl TcpTransport {
	pub fn new(stream: TcpStream) -> Self {
		Self(stream)
	}
}

impl Transport for TcpTransport {
	fn send(&mut self, message: &[u8]) -> Result<()> {
		self.0.write_all(message)?;
		Ok(self.0.flush()?)
	}

	fn receive(&mut self) -> Result<Vec<u8>> {
		let mut len = [0u8; 4];
		self.0.read_exact(&mut len)?;
		let len = u32::from_le_bytes(len) as usize;

		if len < 4 || len > MAX_MESSAGE_SIZE {
			return Err(Error::InvalidReply(format!("invalid message length {}", len)));
		}

		let mut buf = vec![0u8; len];
		buf[..4].copy_from_slice(&(len as u32).to_le_bytes());
		self.0.read_exact(&mut buf[4..])?;
		Ok(buf)
	}

	fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
		Ok(self.0.set_read_timeout(timeout)?)
	}
}

#[cfg(test)]
mod tests {
	use {super::*, std::net::TcpListener};

	fn frame(payload: &[u8]) -> Vec<u8> {
		let mut buf = ((payload.len() + 4) as u32).to_le_bytes().to_vec();
		buf.extend_from_slice(payload);
		buf
	}

	#[test]
	fn tcp_round_trip() {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let port = listener.local_addr().unwrap().port();
		let server = std::thread::spawn(move || {
			let mut stream = TcpTransport::new(listener.accept().unwrap().0);
			let message = stream.receive().unwrap();
			stream.send(&message).unwrap();
		});

		let mut transport = TcpConnector
			.connect(&ServerAddress::new("127.0.0.1", port), Duration::from_secs(1))
			.unwrap();
		transport.send(&frame(b"ping")).unwrap();
		assert_eq!(transport.receive().unwrap(), frame(b"ping"));
		server.join().unwrap();
	}

	#[test]
	fn tcp_rejects_bad_length() {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let port = listener.local_addr().unwrap().port();
		let server = std::thread::spawn(move || {
			let (mut stream, _) = listener.accept().unwrap();
			stream.write_all(&2u32.to_le_bytes()).unwrap();
		});

		let mut transport = TcpConnector
			.connect(&ServerAddress::new("127.0.0.1", port), Duration::from_secs(1))
			.unwrap();
		assert!(matches!(transport.receive(), Err(Error::InvalidReply(_))));
		server.join().unwrap();
	}

	#[test]
	fn decode_legacy_reply() {
		let reply: HelloReply = serde_json::from_str(r#"{
			"ismaster": true,
			"setName": "rs0",
			"hosts": ["a:1", "b:2"],
			"electionId": "000000000000000000000003",
			"topologyVersion": { "processId": "000000000000000000000001", "counter": 4 },
			"maxWireVersion": 13
		}"#).unwrap();

		assert!(reply.is_writable_primary);
		assert_eq!(reply.set_name.as_deref(), Some("rs0"));
		assert_eq!(reply.hosts.len(), 2);
		assert_eq!(reply.election_id, Some(ObjectId::from_counter(3)));
		assert_eq!(reply.topology_version.map(|v| v.counter), Some(4));
		assert_eq!(reply.min_wire_version, 0);
	}
}
