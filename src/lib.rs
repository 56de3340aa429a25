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

//! Server discovery, monitoring, server selection and connection pooling for
//! MongoDB deployments.
//!
//! A [`Topology`] owns one [`ConnectionPool`] and one [`ServerMonitor`] per known server.
//! Monitors feed [`ServerDescription`]s into the shared [`ClusterDescription`], which
//! [`Topology::select_server`] filters by [`ReadPreference`].

#![warn(clippy::all)]
#![forbid(unsafe_code)]

pub use self::{
	apm::{Event, EventEmitter, ConnectionClosedReason, ConnectionCheckOutFailedReason},
	cancel::CancellationToken,
	common::*,
	description::{ServerDescription, ServerType, ClusterDescription, TopologyType, TopologyVersion, CompatibilityError},
	monitor::{ServerMonitor, HeartbeatError, HeartbeatErrorKind, RttMonitor},
	oid::ObjectId,
	pool::{ConnectionPool, PooledConnection, Connection, IdGenerator},
	selection::{ServerSelectionError, select_servers},
	topology::{Topology, Server},
	wire::{Transport, Connector, Authenticator, HelloCodec, HelloReply, TcpConnector, TcpTransport}
};

pub mod apm;
pub mod cancel;
pub mod common;
pub mod description;
pub mod monitor;
pub mod oid;
pub mod pool;
pub mod selection;
pub mod topology;
pub mod wire;
#[cfg(test)]
mod mock;

pub static DRIVER_NAME: &str = "mongo-sdam";
