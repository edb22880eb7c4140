//! Self-description of the event stream for generic consumers.
//!
//! Column attributes follow the usual tracer conventions: width derived from
//! the integer type, left aligned, ellipsis at the end. `timestamp` is a raw
//! monotonic value and is hidden from default columns.

use std::mem::{offset_of, size_of};

use anyhow::{Result, bail};
use aya::{Ebpf, maps::Map};
use lockwatch_common::{EVENTS_MAP, MutexEvent, ProcessInfo, TASK_COMM_LEN};
use serde::Serialize;

pub const TRACER_NAME: &str = "deadlock";
pub const EVENT_STRUCT: &str = "mutex_event";

const DEFAULT_COLUMN_WIDTH: u32 = 16;
const MAX_CHARS_UINT32: u32 = 10;
const MAX_CHARS_UINT64: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    U32,
    U64,
    /// NUL padded byte string.
    Str,
    /// `u32` tag decoded to a name.
    Enum,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldAttributes {
    pub width: u32,
    pub alignment: &'static str,
    pub ellipsis: &'static str,
    pub hidden: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldMetadata {
    pub name: &'static str,
    pub offset: usize,
    pub size: usize,
    pub kind: FieldKind,
    pub attributes: FieldAttributes,
}

#[derive(Debug, Clone, Serialize)]
pub struct TracerMetadata {
    pub name: &'static str,
    pub map_name: &'static str,
    pub struct_name: &'static str,
    pub size: usize,
    pub fields: Vec<FieldMetadata>,
}

fn column_width(kind: FieldKind) -> u32 {
    match kind {
        FieldKind::U32 => MAX_CHARS_UINT32,
        FieldKind::U64 => MAX_CHARS_UINT64,
        FieldKind::Str | FieldKind::Enum => DEFAULT_COLUMN_WIDTH,
    }
}

fn field(name: &'static str, offset: usize, size: usize, kind: FieldKind) -> FieldMetadata {
    FieldMetadata {
        name,
        offset,
        size,
        kind,
        attributes: FieldAttributes {
            width: column_width(kind),
            alignment: "left",
            ellipsis: "end",
            hidden: name == "timestamp",
        },
    }
}

pub fn tracer_metadata() -> TracerMetadata {
    let process = offset_of!(MutexEvent, process);
    TracerMetadata {
        name: TRACER_NAME,
        map_name: EVENTS_MAP,
        struct_name: EVENT_STRUCT,
        size: size_of::<MutexEvent>(),
        fields: vec![
            field("timestamp", offset_of!(MutexEvent, timestamp), 8, FieldKind::U64),
            field("pid", process + offset_of!(ProcessInfo, pid), 4, FieldKind::U32),
            field("tid", process + offset_of!(ProcessInfo, tid), 4, FieldKind::U32),
            field(
                "mntns_id",
                process + offset_of!(ProcessInfo, mntns_id),
                8,
                FieldKind::U64,
            ),
            field(
                "comm",
                process + offset_of!(ProcessInfo, comm),
                TASK_COMM_LEN,
                FieldKind::Str,
            ),
            field("mutex_addr", offset_of!(MutexEvent, mutex_addr), 8, FieldKind::U64),
            field("operation", offset_of!(MutexEvent, operation), 4, FieldKind::Enum),
        ],
    }
}

/// Checks that a loaded object carries the tracer map as a ring buffer.
pub fn validate(bpf: &Ebpf) -> Result<()> {
    match bpf.map(EVENTS_MAP) {
        Some(Map::RingBuf(_)) => Ok(()),
        Some(_) => bail!("map {} is not a ring buffer", EVENTS_MAP),
        None => bail!("tracer map {} not found in object", EVENTS_MAP),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_cover_event_without_overlap() {
        let meta = tracer_metadata();
        assert_eq!(meta.size, 56);

        let mut end = 0;
        for f in &meta.fields {
            assert!(f.offset >= end, "{} overlaps previous field", f.name);
            end = f.offset + f.size;
        }
        // Only the trailing padding is undescribed.
        assert_eq!(end, 52);
    }

    #[test]
    fn test_column_attributes() {
        let meta = tracer_metadata();
        let by_name = |name: &str| meta.fields.iter().find(|f| f.name == name).unwrap();

        assert!(by_name("timestamp").attributes.hidden);
        assert!(!by_name("pid").attributes.hidden);
        assert_eq!(by_name("pid").attributes.width, 10);
        assert_eq!(by_name("mutex_addr").attributes.width, 20);
        assert_eq!(by_name("comm").attributes.width, 16);
        assert!(meta.fields.iter().all(|f| f.attributes.alignment == "left"));
    }

    #[test]
    fn test_metadata_json() {
        let json = serde_json::to_value(tracer_metadata()).unwrap();
        assert_eq!(json["name"], "deadlock");
        assert_eq!(json["map_name"], "EVENTS");
        assert_eq!(json["fields"][6]["name"], "operation");
        assert_eq!(json["fields"][6]["kind"], "enum");
        assert_eq!(json["fields"][6]["offset"], 48);
    }
}
