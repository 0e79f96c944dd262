// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! The [`InstallPlan`], describing the partitions of an update.

use base64::Engine as _;
use otaverify_storage::{dynamic_partition::Slot, verity::VerityLayout};
use serde::{Deserialize, Serialize};

/// (De)serialization of raw bytes as Base64 strings.
mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// A partition to verify.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Partition {
    pub name: String,

    pub source_path: String,
    pub target_path: String,
    /// Path of the mapped read-only view of a dynamic target partition.
    pub readonly_target_path: String,

    pub source_size: u64,
    pub target_size: u64,

    /// Expected SHA-256 digest of the source partition. Empty for full
    /// updates.
    #[serde(with = "base64_bytes")]
    pub source_hash: Vec<u8>,
    /// Expected SHA-256 digest of the target partition.
    #[serde(with = "base64_bytes")]
    pub target_hash: Vec<u8>,

    pub block_size: u32,

    pub hash_tree_algorithm: String,
    #[serde(with = "base64_bytes")]
    pub hash_tree_salt: Vec<u8>,
    pub hash_tree_data_offset: u64,
    pub hash_tree_data_size: u64,
    pub hash_tree_offset: u64,
    pub hash_tree_size: u64,

    pub fec_data_offset: u64,
    pub fec_data_size: u64,
    pub fec_offset: u64,
    pub fec_size: u64,
    pub fec_roots: u32,
}

impl Default for Partition {
    fn default() -> Self {
        Self {
            name: String::new(),
            source_path: String::new(),
            target_path: String::new(),
            readonly_target_path: String::new(),
            source_size: 0,
            target_size: 0,
            source_hash: Vec::new(),
            target_hash: Vec::new(),
            block_size: 4096,
            hash_tree_algorithm: "sha256".to_owned(),
            hash_tree_salt: Vec::new(),
            hash_tree_data_offset: 0,
            hash_tree_data_size: 0,
            hash_tree_offset: 0,
            hash_tree_size: 0,
            fec_data_offset: 0,
            fec_data_size: 0,
            fec_offset: 0,
            fec_size: 0,
            fec_roots: 2,
        }
    }
}

impl Partition {
    /// The read-only target path to open for a mapped dynamic partition,
    /// falling back to the plain target path if none had been resolved.
    pub fn effective_readonly_target_path(&self) -> &str {
        if self.readonly_target_path.is_empty() {
            &self.target_path
        } else {
            &self.readonly_target_path
        }
    }

    pub fn has_verity_metadata(&self) -> bool {
        self.hash_tree_size > 0 || self.fec_size > 0
    }

    pub fn verity_layout(&self) -> VerityLayout {
        VerityLayout {
            block_size: self.block_size,
            hash_tree_algorithm: self.hash_tree_algorithm.clone(),
            hash_tree_salt: self.hash_tree_salt.clone(),
            hash_tree_data_offset: self.hash_tree_data_offset,
            hash_tree_data_size: self.hash_tree_data_size,
            hash_tree_offset: self.hash_tree_offset,
            hash_tree_size: self.hash_tree_size,
            fec_data_offset: self.fec_data_offset,
            fec_data_size: self.fec_data_size,
            fec_offset: self.fec_offset,
            fec_size: self.fec_size,
            fec_roots: self.fec_roots,
        }
    }
}

/// The update's partitions and how to verify them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallPlan {
    pub source_slot: Slot,
    pub target_slot: Slot,
    /// Whether dm-verity metadata gets computed and written for the
    /// target partitions.
    pub write_verity: bool,
    /// The partitions, in verification order.
    pub partitions: Vec<Partition>,
    /// Dynamic partitions not written by the update, whose extents must
    /// nonetheless be consistent between the slots.
    pub untouched_dynamic_partitions: Vec<String>,
}

impl Default for InstallPlan {
    fn default() -> Self {
        Self {
            source_slot: Slot::INVALID,
            target_slot: Slot::INVALID,
            write_verity: true,
            partitions: Vec::new(),
            untouched_dynamic_partitions: Vec::new(),
        }
    }
}

impl InstallPlan {
    /// Whether this is a delta update, i.e. depends on the source slot's
    /// content.
    pub fn is_delta(&self) -> bool {
        self.partitions.iter().any(|p| !p.source_hash.is_empty())
    }

    /// Log the plan.
    pub fn dump(&self) {
        let b64 = &base64::engine::general_purpose::STANDARD;
        tracing::info!(
            source_slot = %self.source_slot,
            target_slot = %self.target_slot,
            write_verity = self.write_verity,
            partitions = self.partitions.len(),
            delta = self.is_delta(),
            "install plan"
        );
        for p in self.partitions.iter() {
            tracing::info!(
                partition = %p.name,
                source_path = %p.source_path,
                source_size = p.source_size,
                source_hash = %b64.encode(&p.source_hash),
                target_path = %p.target_path,
                target_size = p.target_size,
                target_hash = %b64.encode(&p.target_hash),
                hash_tree_offset = p.hash_tree_offset,
                hash_tree_size = p.hash_tree_size,
                fec_offset = p.fec_offset,
                fec_size = p.fec_size,
                "install plan partition"
            );
        }
        if !self.untouched_dynamic_partitions.is_empty() {
            tracing::info!(
                partitions = ?self.untouched_dynamic_partitions,
                "untouched dynamic partitions"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_defaults() {
        let plan: InstallPlan = serde_json::from_str(
            r#"{
                "source_slot": 0,
                "target_slot": 1,
                "partitions": [
                    {
                        "name": "system",
                        "target_path": "/dev/block/by-name/system_b",
                        "target_size": 8192,
                        "target_hash": "3q2+7w=="
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(plan.source_slot, Slot(0));
        assert_eq!(plan.target_slot, Slot(1));
        assert!(plan.write_verity);
        assert!(plan.untouched_dynamic_partitions.is_empty());
        assert!(!plan.is_delta());

        let p = &plan.partitions[0];
        assert_eq!(p.target_hash, vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(p.source_hash.is_empty());
        assert_eq!(p.block_size, 4096);
        assert_eq!(p.fec_roots, 2);
        assert!(!p.has_verity_metadata());
        assert_eq!(p.effective_readonly_target_path(), "/dev/block/by-name/system_b");
    }

    #[test]
    fn test_serialize_roundtrip() {
        let plan = InstallPlan {
            source_slot: Slot(0),
            target_slot: Slot(1),
            write_verity: false,
            partitions: vec![Partition {
                name: "vendor".to_owned(),
                source_hash: vec![1, 2, 3],
                hash_tree_salt: vec![0xff; 8],
                readonly_target_path: "/dev/mapper/vendor_b".to_owned(),
                ..Default::default()
            }],
            untouched_dynamic_partitions: vec!["odm".to_owned()],
        };
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["partitions"][0]["source_hash"], "AQID");
        let parsed: InstallPlan = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, plan);
        assert!(parsed.is_delta());
        assert_eq!(
            parsed.partitions[0].effective_readonly_target_path(),
            "/dev/mapper/vendor_b"
        );
    }

    #[test]
    fn test_invalid_base64() {
        let r: Result<Partition, _> = serde_json::from_str(r#"{"target_hash": "not base64!"}"#);
        assert!(r.is_err());
    }
}
