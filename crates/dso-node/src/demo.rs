//! Two-client workload used by the `dso` binary

use crate::node::{ClientNode, DsoNode};
use dso_client::{ClassRegistry, ClientObjectManager, Peer, Reference, SharedObject};
use dso_common::{Dna, DnaWriter, DsoResult, LockScope, Value};
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;

/// Singly linked list cell.
#[derive(Debug, Default)]
pub struct ListNode {
    /// Payload
    pub value: i64,
    /// Next cell
    pub next: Reference,
}

impl SharedObject for ListNode {
    fn class_name(&self) -> &str {
        "ListNode"
    }

    fn dehydrate(&self, writer: &mut DnaWriter) {
        writer.field("value", self.value).field("next", self.next.to_value());
    }

    fn hydrate(&mut self, dna: &Dna) -> DsoResult<()> {
        self.value = dna.field("value").and_then(Value::as_int).unwrap_or_default();
        self.next = dna.field("next").map(Reference::from_value).unwrap_or_default();
        Ok(())
    }

    fn visit_references(&mut self, visitor: &mut dyn FnMut(&mut Reference)) {
        visitor(&mut self.next);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Classes the demo clients can fault in.
pub fn demo_classes() -> ClassRegistry {
    let mut classes = ClassRegistry::new();
    classes.register_default::<ListNode>("ListNode");
    classes
}

/// What the workload observed.
#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    /// List cells shared by the writer
    pub list_length: usize,
    /// Sum of values as read back by the second client
    pub reader_sum: i64,
    /// Map reads served from the reader's local cache
    pub map_hits: u64,
    /// Map reads that went to the server
    pub map_misses: u64,
    /// Objects removed by the DGC pass after the list was unrooted
    pub collected: usize,
    /// Whether the reader sees the old head as collected
    pub reader_sees_tombstone: bool,
}

/// Share a list through one client, read it and a server map through
/// another, then unroot the list and collect it.
pub fn run_demo(node: &DsoNode, length: usize) -> anyhow::Result<DemoReport> {
    let writer = node.connect(demo_classes())?;
    let reader = node.connect(demo_classes())?;
    let scope = LockScope::new("demo");

    let old_head = {
        let head = build_list(writer.objects(), length)?;
        writer.objects().create_or_replace_root("list", &head)?;
        head.id()
    };

    let reader_sum = {
        let head = reader.objects().lookup_root("list")?;
        sum_list(reader.objects(), head)?
    };

    let settings = writer.create_map("settings")?;
    settings.put(Value::from("greeting"), Value::from("hello"), &scope)?;
    let (map_hits, map_misses) = read_map(&reader)?;

    let replacement = writer.objects().share(ListNode::default())?;
    writer.objects().create_or_replace_root("list", &replacement)?;
    let result = node.gc()?;

    let reader_sees_tombstone = old_head.is_some_and(|id| reader.objects().is_tombstoned(id));
    tracing::info!(
        target: "dso::node",
        length,
        reader_sum,
        collected = result.collected.len(),
        "demo complete"
    );

    node.disconnect(&reader);
    node.disconnect(&writer);
    Ok(DemoReport {
        list_length: length,
        reader_sum,
        map_hits,
        map_misses,
        collected: result.collected.len(),
        reader_sees_tombstone,
    })
}

fn build_list(objects: &ClientObjectManager, length: usize) -> DsoResult<Arc<Peer>> {
    let mut next = Reference::null();
    for value in (1..=length as i64).rev() {
        let cell = objects.share(ListNode { value, next })?;
        next = objects.reference_to(&cell)?;
    }
    match next.get() {
        Some(head) => Ok(Arc::clone(head)),
        None => objects.share(ListNode::default()),
    }
}

fn sum_list(objects: &ClientObjectManager, head: Option<Arc<Peer>>) -> DsoResult<i64> {
    let mut sum = 0;
    let mut cursor = head;
    while let Some(cell) = cursor {
        sum += cell.read(|n: &ListNode| n.value).unwrap_or_default();
        cursor = cell
            .write(|n: &mut ListNode| {
                if n.next.is_null() {
                    Ok(None)
                } else {
                    objects.resolve(&mut n.next).map(Some)
                }
            })
            .unwrap_or(Ok(None))?;
    }
    Ok(sum)
}

fn read_map(reader: &ClientNode) -> DsoResult<(u64, u64)> {
    let Some(settings) = reader.open_map("settings")? else {
        return Ok((0, 0));
    };
    for _ in 0..3 {
        settings.get(&Value::from("greeting"))?;
    }
    let stats = settings.stats();
    Ok((stats.hits, stats.misses))
}
