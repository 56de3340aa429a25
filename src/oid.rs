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

use serde::{Serialize, Serializer, Deserialize, Deserializer};

/// An object id as reported by servers in `electionId` and `topologyVersion.processId`.
/// The byte order is significant, election ids are compared bytewise.
///
/// see https://github.com/mongodb/specifications/blob/master/source/objectid.rst
#[derive(Default, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct ObjectId(pub [u8; 12]);

#[derive(Copy, Clone, Debug, Ord, PartialOrd, Eq, PartialEq, thiserror::Error)]
#[error("invalid object id")]
pub struct OidError;

impl ObjectId {
	/// An id whose last four bytes hold `counter`, handy for ordering election ids.
	pub fn from_counter(counter: u32) -> Self {
		let mut id = [0u8; 12];
		id[8..].copy_from_slice(&counter.to_be_bytes());
		Self(id)
	}
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ObjectIdRepr {
	Hex(String),
	Extended {
		#[serde(rename = "$oid")]
		oid: String
	},
	Bytes([u8; 12])
}

impl Serialize for ObjectId {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error> where
		S: Serializer {
		if serializer.is_human_readable() {
			serializer.collect_str(self)
		} else {
			self.0.serialize(serializer)
		}
	}
}

impl<'de> Deserialize<'de> for ObjectId {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error> where
		D: Deserializer<'de> {
		use std::str::FromStr;
		match ObjectIdRepr::deserialize(deserializer)? {
			ObjectIdRepr::Hex(oid) | ObjectIdRepr::Extended { oid } =>
				Self::from_str(&oid).map_err(serde::de::Error::custom),
			ObjectIdRepr::Bytes(bytes) => Ok(Self(bytes))
		}
	}
}

impl std::str::FromStr for ObjectId {
	type Err = OidError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.len() != 24 { return Err(OidError) }

		fn parse_digit(ch: char) -> Result<u8, OidError> {
			ch.to_digit(16).map(|v| v as u8).ok_or(OidError)
		}

		let mut id = [0u8; 12];
		let mut iter = s.chars();

		for id in &mut id {
			*id = (iter.next().ok_or(OidError).and_then(parse_digit)? << 4)
				| iter.next().ok_or(OidError).and_then(parse_digit)?;
		}
		Ok(Self(id))
	}
}

impl std::fmt::Debug for ObjectId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_tuple("ObjectId")
			.field(&self.to_string())
			.finish()
	}
}

impl std::fmt::Display for ObjectId {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		self.0.iter().try_for_each(|b| write!(f, "{:02x}", b))
	}
}
