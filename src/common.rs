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

use {
	crate::selection::ServerSelectionError,
	std::{str::FromStr, time::Duration, collections::HashMap, fmt},
	serde::{Serialize, Deserialize, Serializer, Deserializer}
};

pub const DEFAULT_MONGO_PORT:              u16      = 27017;
pub const DEFAULT_CONNECT_TIMEOUT:         Duration = Duration::from_secs(10);
pub const DEFAULT_MIN_POOL_SIZE:           usize    = 0;
pub const DEFAULT_MAX_POOL_SIZE:           usize    = 100;
pub const DEFAULT_MAX_CONNECTING:          usize    = 2;
pub const DEFAULT_WAIT_QUEUE_TIMEOUT:      Duration = Duration::from_secs(120);
pub const DEFAULT_MAINTENANCE_FREQUENCY:   Duration = Duration::from_secs(10);
pub const DEFAULT_LOCAL_THRESHOLD:         Duration = Duration::from_millis(15);
pub const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_FREQUENCY:     Duration = Duration::from_secs(10);
pub const DEFAULT_MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);
/// The lower bound of `heartbeatFrequencyMS`.
pub const SMALLEST_HEARTBEAT_FREQUENCY:    Duration = Duration::from_millis(500);
/// The lower bound of `maxStalenessSeconds`.
pub const SMALLEST_MAX_STALENESS:          Duration = Duration::from_secs(90);
/// How often a primary writes a no-op to the oplog when idle.
pub const IDLE_WRITE_PERIOD:               Duration = Duration::from_secs(10);

/// The address of a single server, `host:port`.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ServerAddress {
	pub host: String,
	pub port: u16
}

impl ServerAddress {
	pub fn new(host: &str, port: u16) -> Self {
		Self { host: host.to_ascii_lowercase(), port }
	}
}

impl Default for ServerAddress {
	fn default() -> Self {
		Self::new("localhost", DEFAULT_MONGO_PORT)
	}
}

impl FromStr for ServerAddress {
	type Err = ClientOptionsParseError;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		let invalid = || ClientOptionsParseError::InvalidHost(s.to_string());

		// ip v6 literal, e.g. `[::1]:27017`
		let (host, port) = if let Some(rest) = s.strip_prefix('[') {
			let i = rest.find(']').ok_or_else(invalid)?;
			(&rest[..i], rest[i + 1..].strip_prefix(':'))
		} else {
			match s.rfind(':') {
				Some(i) => (&s[..i], Some(&s[i + 1..])),
				None    => (s, None)
			}
		};

		if host.is_empty() {
			return Err(invalid());
		}

		let port = match port {
			Some(port) => port.parse().map_err(|_| invalid())?,
			None       => DEFAULT_MONGO_PORT
		};

		Ok(Self::new(host, port))
	}
}

impl fmt::Display for ServerAddress {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		if self.host.contains(':') {
			write!(f, "[{}]:{}", self.host, self.port)
		} else {
			write!(f, "{}:{}", self.host, self.port)
		}
	}
}

impl Serialize for ServerAddress {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> where
		S: Serializer {
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for ServerAddress {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error> where
		D: Deserializer<'de> {
		String::deserialize(deserializer)?.parse().map_err(serde::de::Error::custom)
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/connection-string/connection-string-spec.rst,
/// https://github.com/mongodb/specifications/blob/master/source/uri-options/uri-options.rst
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientOptions {
	pub hosts:                   Vec<ServerAddress>,
	pub replica_set:             Option<String>,
	pub direct_connection:       Option<bool>,
	pub pool_options:            ConnectionPoolOptions,
	pub server_selection_config: ServerSelectionConfig,
	pub read_preference:         ReadPreference
}

impl Default for ClientOptions {
	fn default() -> Self {
		Self {
			hosts:                   Vec::new(),
			replica_set:             None,
			direct_connection:       None,
			pool_options:            ConnectionPoolOptions::default(),
			server_selection_config: ServerSelectionConfig::default(),
			read_preference:         ReadPreference::default()
		}
	}
}

impl ClientOptions {
	/// Returns true if the topology should use its only seed directly, whatever it
	/// turns out to be. Otherwise a lone seed is discovered like any other deployment.
	pub fn is_single(&self) -> bool {
		self.direct_connection == Some(true)
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ClientOptionsParseError {
	#[error("the connection string must start with `mongodb://`")]
	InvalidScheme,
	#[error("credentials are not accepted in the connection string")]
	Credentials,
	#[error("invalid host `{0}`")]
	InvalidHost(String),
	#[error("unknown option `{0}`")]
	InvalidKey(String),
	#[error("invalid value for `{key}`: {val:?}")]
	InvalidValue { key: &'static str, val: Box<dyn fmt::Debug + Send + Sync + 'static> }
}

impl<T: fmt::Debug + Send + Sync + 'static> From<(&'static str, T)> for ClientOptionsParseError {
	fn from((key, val): (&'static str, T)) -> Self {
		Self::InvalidValue { key, val: Box::new(val) }
	}
}

fn parse_millis(key: &'static str, value: &str) -> std::result::Result<Duration, ClientOptionsParseError> {
	value.parse::<u64>()
		.map(Duration::from_millis)
		.map_err(|e| ClientOptionsParseError::from((key, e)))
}

/// Like `parse_millis`, but rejects values below `min`.
fn parse_millis_min(key: &'static str, value: &str, min: Duration) -> std::result::Result<Duration, ClientOptionsParseError> {
	match parse_millis(key, value)? {
		v if v < min => Err(ClientOptionsParseError::from((key, v))),
		v => Ok(v)
	}
}

fn parse_bool(key: &'static str, value: &str) -> std::result::Result<bool, ClientOptionsParseError> {
	match value {
		"true"  => Ok(true),
		"false" => Ok(false),
		_       => Err(ClientOptionsParseError::from((key, value.to_string())))
	}
}

impl FromStr for ClientOptions {
	type Err = Error;

	fn from_str(mut s: &str) -> std::result::Result<Self, Self::Err> {
		let mut self_ = Self::default();

		s = s.strip_prefix("mongodb://")
			.ok_or(ClientOptionsParseError::InvalidScheme)?;

		let i = s.find(|c: char| c == '/' || c == '?').unwrap_or_else(|| s.len());
		let (hosts, rest) = s.split_at(i);

		if hosts.contains('@') {
			return Err(ClientOptionsParseError::Credentials.into());
		}

		self_.hosts = hosts.split(',')
			.map(ServerAddress::from_str)
			.collect::<std::result::Result<_, _>>()?;

		// the auth database is of no interest here
		let options = match rest.find('?') {
			Some(i) => &rest[i + 1..],
			None    => return Ok(self_)
		};

		options.split('&').filter(|s| !s.is_empty()).map(|s| {
			let i = s.find('=').unwrap_or_else(|| s.len());
			(&s[..i], s.get(i + 1..).unwrap_or(""))
		}).try_for_each(|(key, value)| Ok::<_, ClientOptionsParseError>(match key {
			"replicaSet"               => self_.replica_set = Some(value.to_string()),
			"directConnection"         => self_.direct_connection = Some(parse_bool("directConnection", value)?),
			"connectTimeoutMS"         => self_.pool_options.connect_timeout = parse_millis("connectTimeoutMS", value)?,
			"maxPoolSize"              => self_.pool_options.max_pool_size = value.parse()
				.map_err(|e| ClientOptionsParseError::from(("maxPoolSize", e)))?,
			"minPoolSize"              => self_.pool_options.min_pool_size = value.parse()
				.map_err(|e| ClientOptionsParseError::from(("minPoolSize", e)))?,
			"maxConnecting"            => self_.pool_options.max_connecting = match value.parse::<usize>()
				.map_err(|e| ClientOptionsParseError::from(("maxConnecting", e)))? {
				0 => return Err(ClientOptionsParseError::from(("maxConnecting", 0))),
				v => v
			},
			"maxIdleTimeMS"            => self_.pool_options.max_idle_time = Some(parse_millis("maxIdleTimeMS", value)?)
				.filter(|v| *v != Duration::from_millis(0)),
			"maxLifeTimeMS"            => self_.pool_options.max_lifetime = Some(parse_millis("maxLifeTimeMS", value)?)
				.filter(|v| *v != Duration::from_millis(0)),
			"waitQueueTimeoutMS"       => self_.pool_options.wait_queue_timeout = parse_millis("waitQueueTimeoutMS", value)?,
			"maintenanceFrequencyMS"   => self_.pool_options.maintenance_frequency = parse_millis_min(
				"maintenanceFrequencyMS", value, Duration::from_millis(1))?,
			"heartbeatFrequencyMS"     => self_.server_selection_config.heartbeat_frequency = parse_millis_min(
				"heartbeatFrequencyMS", value, SMALLEST_HEARTBEAT_FREQUENCY)?,
			"minHeartbeatFrequencyMS"  => self_.server_selection_config.min_heartbeat_frequency = parse_millis_min(
				"minHeartbeatFrequencyMS", value, Duration::from_millis(1))?,
			"localThresholdMS"         => self_.server_selection_config.local_threshold = parse_millis("localThresholdMS", value)?,
			"serverSelectionTimeoutMS" => self_.server_selection_config.server_selection_timeout = parse_millis("serverSelectionTimeoutMS", value)?,
			"readPreference"           => self_.read_preference.mode = value.parse()
				.map_err(|e| ClientOptionsParseError::from(("readPreference", e)))?,
			"readPreferenceTags"       => self_.read_preference.tag_sets.push(value.split(',')
				.filter(|s| !s.is_empty())
				.map(|s| {
					let i = s.find(':').unwrap_or_else(|| s.len());
					(s[..i].to_string(), s.get(i + 1..).unwrap_or("").to_string())
				})
				.collect()),
			"maxStalenessSeconds"      => self_.read_preference.max_staleness = match value.parse::<i64>()
				.map_err(|e| ClientOptionsParseError::from(("maxStalenessSeconds", e)))? {
				-1                 => None,
				secs if secs >= 0  => Some(Duration::from_secs(secs as u64)),
				secs               => return Err(ClientOptionsParseError::from(("maxStalenessSeconds", secs)))
			},
			key => return Err(ClientOptionsParseError::InvalidKey(key.to_string()))
		}))?;

		// a max pool size of 0 means unlimited
		if self_.pool_options.max_pool_size != 0 && self_.pool_options.min_pool_size > self_.pool_options.max_pool_size {
			return Err(ClientOptionsParseError::from(("minPoolSize", self_.pool_options.min_pool_size)).into());
		}

		if self_.direct_connection == Some(true) && self_.hosts.len() > 1 {
			return Err(ClientOptionsParseError::from(("directConnection", self_.hosts.len())).into());
		}

		Ok(self_)
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionPoolOptions {
	pub max_pool_size:         usize,
	pub min_pool_size:         usize,
	/// How many connections may be established at the same time.
	pub max_connecting:        usize,
	/// Available connections idle for longer than this are closed.
	pub max_idle_time:         Option<Duration>,
	/// Connections older than this are closed once they are back in the pool.
	pub max_lifetime:          Option<Duration>,
	pub wait_queue_timeout:    Duration,
	pub maintenance_frequency: Duration,
	pub connect_timeout:       Duration
}

impl Default for ConnectionPoolOptions {
	fn default() -> Self {
		Self {
			max_pool_size:         DEFAULT_MAX_POOL_SIZE,
			min_pool_size:         DEFAULT_MIN_POOL_SIZE,
			max_connecting:        DEFAULT_MAX_CONNECTING,
			max_idle_time:         None,
			max_lifetime:          None,
			wait_queue_timeout:    DEFAULT_WAIT_QUEUE_TIMEOUT,
			maintenance_frequency: DEFAULT_MAINTENANCE_FREQUENCY,
			connect_timeout:       DEFAULT_CONNECT_TIMEOUT
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSelectionConfig {
	pub local_threshold:          Duration,
	pub server_selection_timeout: Duration,
	pub heartbeat_frequency:      Duration,
	pub min_heartbeat_frequency:  Duration
}

impl Default for ServerSelectionConfig {
	fn default() -> Self {
		Self {
			local_threshold:          DEFAULT_LOCAL_THRESHOLD,
			server_selection_timeout: DEFAULT_SERVER_SELECTION_TIMEOUT,
			heartbeat_frequency:      DEFAULT_HEARTBEAT_FREQUENCY,
			min_heartbeat_frequency:  DEFAULT_MIN_HEARTBEAT_FREQUENCY
		}
	}
}

pub type TagSet = HashMap<String, String>;

/// see https://github.com/mongodb/specifications/blob/master/source/server-selection/server-selection.rst#read-preference
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReadPreference {
	pub mode:          ReadPreferenceMode,
	pub tag_sets:      Vec<TagSet>,
	pub max_staleness: Option<Duration>
}

impl Default for ReadPreference {
	fn default() -> Self {
		Self::primary()
	}
}

impl ReadPreference {
	pub fn new(mode: ReadPreferenceMode) -> Self {
		Self { mode, tag_sets: Vec::new(), max_staleness: None }
	}

	pub fn primary() -> Self {
		Self::new(ReadPreferenceMode::Primary)
	}

	pub fn primary_preferred() -> Self {
		Self::new(ReadPreferenceMode::PrimaryPreferred)
	}

	pub fn secondary() -> Self {
		Self::new(ReadPreferenceMode::Secondary)
	}

	pub fn secondary_preferred() -> Self {
		Self::new(ReadPreferenceMode::SecondaryPreferred)
	}

	pub fn nearest() -> Self {
		Self::new(ReadPreferenceMode::Nearest)
	}

	pub fn with_tag_sets(mut self, tag_sets: Vec<TagSet>) -> Self {
		self.tag_sets = tag_sets;
		self
	}

	pub fn with_max_staleness(mut self, max_staleness: Duration) -> Self {
		self.max_staleness = Some(max_staleness);
		self
	}

	/// Checks the combination of options, `heartbeat_frequency` is needed to validate the max staleness.
	pub fn validate(&self, heartbeat_frequency: Duration) -> std::result::Result<(), ServerSelectionError> {
		if self.mode == ReadPreferenceMode::Primary {
			if self.tag_sets.iter().any(|tags| !tags.is_empty()) {
				return Err(ServerSelectionError::InvalidReadPreference("tag sets are not allowed with mode primary"));
			}

			if self.max_staleness.is_some() {
				return Err(ServerSelectionError::InvalidReadPreference("max staleness is not allowed with mode primary"));
			}
		}

		match self.max_staleness {
			Some(max) if max < SMALLEST_MAX_STALENESS || max < heartbeat_frequency + IDLE_WRITE_PERIOD =>
				Err(ServerSelectionError::InvalidReadPreference("max staleness is too small")),
			_ => Ok(())
		}
	}
}

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadPreferenceMode {
	Primary,
	PrimaryPreferred,
	Secondary,
	SecondaryPreferred,
	Nearest
}

impl Default for ReadPreferenceMode {
	fn default() -> Self {
		Self::Primary
	}
}

impl FromStr for ReadPreferenceMode {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"primary"            => Self::Primary,
			"primaryPreferred"   => Self::PrimaryPreferred,
			"secondary"          => Self::Secondary,
			"secondaryPreferred" => Self::SecondaryPreferred,
			"nearest"            => Self::Nearest,
			_ => return Err(s.to_string())
		})
	}
}

pub type MDBResult<T> = std::result::Result<T, Error>;
pub(crate) type Result<T> = MDBResult<T>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	InvalidClientOptions(#[from] ClientOptionsParseError),
	#[error("a lock has been poisoned")]
	Sync,
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error("authentication failed: {0}")]
	Auth(String),
	#[error("invalid reply: {0}")]
	InvalidReply(String),
	/// A command failed on the server.
	#[error("command failed with code {code}: {message}")]
	Command {
		code:    i32,
		message: String
	},
	/// Opening or authenticating a new connection failed.
	#[error("failed to establish a connection to {address}: {source}")]
	Handshake {
		address: ServerAddress,
		source:  Box<Error>
	},
	/// The pool had no capacity before the deadline.
	#[error("timed out after {timeout:?} waiting for a connection to {address}")]
	WaitQueueTimeout {
		address: ServerAddress,
		timeout: Duration
	},
	#[error("the connection pool for {address} has been closed")]
	PoolClosed {
		address: ServerAddress
	},
	#[error(transparent)]
	ServerSelection(#[from] ServerSelectionError),
	#[error("the operation has been cancelled")]
	Cancelled
}

impl Error {
	/// The server is not (or no longer) primary.
	///
	/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#not-writable-primary-and-node-is-recovering
	pub fn is_not_writable_primary(&self) -> bool {
		matches!(self, Self::Command { code: 10107 | 13435 | 10058, .. })
	}

	pub fn is_node_recovering(&self) -> bool {
		matches!(self, Self::Command { code: 11600 | 11602 | 13436 | 189 | 91, .. })
	}

	/// The server is shutting down.
	pub fn is_shutdown(&self) -> bool {
		matches!(self, Self::Command { code: 11600 | 91, .. })
	}

	/// A not primary or node is recovering error, the server's state has changed.
	pub fn is_state_change(&self) -> bool {
		self.is_not_writable_primary() || self.is_node_recovering()
	}

	/// A network error other than a timeout.
	pub fn is_network(&self) -> bool {
		matches!(self, Self::Io(e) if !matches!(e.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock))
	}
}

impl<T> From<std::sync::PoisonError<T>> for Error {
	fn from(_: std::sync::PoisonError<T>) -> Self {
		Self::Sync
	}
}
