#![forbid(unsafe_code)]

use crate::domain::ImageItem;

/// One enriched item ready for transmission: complete metadata plus the
/// actual payload bytes. Payload length is always re-derived from `bytes`,
/// never trusted from the caller-declared `size`.
#[derive(Clone, Debug, PartialEq)]
pub struct EnrichedItem {
    pub item: ImageItem,
    pub bytes: Vec<u8>,
}

/// Outcome of planning one batch: the chunks to emit plus how many items
/// were dropped as unusable.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChunkPlan {
    pub chunks: Vec<Vec<EnrichedItem>>,
    pub dropped: usize,
}

impl ChunkPlan {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn item_count(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }
}

/// Splits enriched batches into bounded chunks for the upstream transport.
#[derive(Clone, Copy, Debug)]
pub struct ChunkPlanner {
    chunk_size: usize,
    min_payload_bytes: usize,
}

impl ChunkPlanner {
    pub fn new(chunk_size: usize, min_payload_bytes: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            min_payload_bytes,
        }
    }

    /// Drops items whose payload is at or below the corrupt threshold, fills
    /// in a filename when the producer omitted one, and splits the remainder
    /// into fixed-size chunks. Item order is preserved across chunks.
    pub fn plan(&self, items: Vec<EnrichedItem>) -> ChunkPlan {
        let total = items.len();
        let usable: Vec<EnrichedItem> = items
            .into_iter()
            .filter(|entry| entry.bytes.len() > self.min_payload_bytes)
            .map(|mut entry| {
                entry.item.size = Some(entry.bytes.len() as u64);
                if entry.item.filename.as_deref().unwrap_or("").is_empty() {
                    entry.item.filename = Some(infer_filename(
                        &entry.item.element_id,
                        entry.item.mime_type.as_deref(),
                    ));
                }
                entry
            })
            .collect();

        let dropped = total - usable.len();
        let mut chunks = Vec::with_capacity(usable.len().div_ceil(self.chunk_size));
        let mut remaining = usable;
        while !remaining.is_empty() {
            let rest = remaining.split_off(remaining.len().min(self.chunk_size));
            chunks.push(remaining);
            remaining = rest;
        }

        ChunkPlan { chunks, dropped }
    }
}

/// Filename inference for items whose producer never set one.
pub fn infer_filename(element_id: &str, mime_type: Option<&str>) -> String {
    let ext = match mime_type.unwrap_or("") {
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/png" => ".png",
        "image/webp" => ".webp",
        "image/gif" => ".gif",
        "image/bmp" => ".bmp",
        "image/tiff" => ".tiff",
        "image/x-icon" | "image/vnd.microsoft.icon" => ".ico",
        _ => "",
    };
    format!("{element_id}{ext}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, len: usize) -> EnrichedItem {
        EnrichedItem {
            item: ImageItem {
                element_id: id.to_string(),
                mime_type: Some("image/png".to_string()),
                filename: None,
                src: None,
                size: None,
                image_data: None,
            },
            bytes: vec![0xaa; len],
        }
    }

    #[test]
    fn splits_into_bounded_chunks_preserving_order() {
        let planner = ChunkPlanner::new(12, 16);
        let plan = planner.plan((0..25).map(|i| entry(&format!("el-{i}"), 64)).collect());
        assert_eq!(plan.chunk_count(), 3);
        assert_eq!(plan.chunks[0].len(), 12);
        assert_eq!(plan.chunks[1].len(), 12);
        assert_eq!(plan.chunks[2].len(), 1);
        assert_eq!(plan.chunks[0][0].item.element_id, "el-0");
        assert_eq!(plan.chunks[2][0].item.element_id, "el-24");
    }

    #[test]
    fn drops_payloads_at_or_below_threshold() {
        let planner = ChunkPlanner::new(12, 16);
        let plan = planner.plan(vec![entry("a", 16), entry("b", 17), entry("c", 0)]);
        assert_eq!(plan.dropped, 2);
        assert_eq!(plan.item_count(), 1);
        assert_eq!(plan.chunks[0][0].item.element_id, "b");
    }

    #[test]
    fn rederives_size_and_infers_filename() {
        let planner = ChunkPlanner::new(4, 16);
        let mut input = entry("el-9", 100);
        input.item.size = Some(5);
        let plan = planner.plan(vec![input]);
        let planned = &plan.chunks[0][0].item;
        assert_eq!(planned.size, Some(100));
        assert_eq!(planned.filename.as_deref(), Some("el-9.png"));
    }

    #[test]
    fn unknown_mime_yields_bare_element_id() {
        assert_eq!(infer_filename("el-1", Some("image/avif")), "el-1");
        assert_eq!(infer_filename("el-2", None), "el-2");
        assert_eq!(infer_filename("el-3", Some("image/jpeg")), "el-3.jpg");
    }

    #[test]
    fn empty_batch_plans_no_chunks() {
        let planner = ChunkPlanner::new(12, 16);
        assert_eq!(planner.plan(Vec::new()), ChunkPlan::default());
    }
}
