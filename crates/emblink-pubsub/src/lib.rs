/*! Hierarchical retained-value publish/subscribe core.

A [`PubSub`] owns a topic tree (nodes created lazily on first publish or
subscribe, never removed until the instance itself is dropped), a bounded
FIFO of queued messages, and a circular byte arena backing non-CONST
`Str`/`Json`/`Bin` payloads. `publish`/`publish_const` resolve (creating if
absent) the topic's tree node and copy/queue the value synchronously,
returning [`PublishError::NotEnoughMemory`]/[`PublishError::Full`]/
[`PublishError::TooBig`]/[`PublishError::Busy`] to the caller the moment any
of those bounded resources is exhausted -- no failure is ever discovered
later and silently dropped. Subscriber fan-out itself still happens later,
inside [`PubSub::process`], since it can call arbitrarily many subscriber
callbacks and isn't something a `publish` caller should pay for inline.

Subscribers and the "who published this" source identity are modeled the
same way the transport layer models port handlers: a plain function pointer
plus an opaque `usize` token, compared by value -- no trait objects, no
allocator, so a publisher's own re-publication of a value is reliably
recognized and skipped during fan-out.
*/
#![no_std]

mod arena;
mod topic;
mod value;

pub use arena::ArenaError;
pub use topic::{MAX_SEGMENT_LEN, MAX_TOPIC_LEN};
pub use value::{Value, ValueFlags};

use arena::{Arena, ArenaSpan};
use emblink_common::dev_warn;
use emblink_common::util::RingBuffer;
use topic::TopicPath;

type NodeIdx = u16;
const ROOT: NodeIdx = 0;

/// `(function pointer, user-data token)` identifying a subscriber or a
/// publish's originator. Two sources are equal iff both fields match
/// exactly, matching the spec's requirement that a publisher never receives
/// its own publication.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Source {
    pub func: Option<SubscriberFn>,
    pub user_data: usize,
}

impl Source {
    pub const NONE: Source = Source { func: None, user_data: 0 };
}

impl Default for Source {
    fn default() -> Self {
        Source::NONE
    }
}

pub type SubscriberFn = fn(user_data: usize, topic: &str, value: Value<'_>, source: Source) -> i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishError {
    /// `RETAIN` was requested on a non-CONST `Str`/`Json`/`Bin` value, or
    /// `publish`/`publish_const` was called with a `CONST` flag mismatching
    /// the entry point.
    ParameterInvalid,
    /// The arena has no room for this payload right now.
    Full,
    /// The payload is larger than half the arena's capacity and can never
    /// be queued.
    TooBig,
    /// The topic tree has no room left for a new node on this path.
    NotEnoughMemory,
    /// The outgoing message queue is full.
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeError {
    /// The node's subscriber list is full.
    Full,
    /// The topic tree has no room left for a new node on this path.
    NotEnoughMemory,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct Subscriber {
    func: SubscriberFn,
    user_data: usize,
    link: bool,
}

#[derive(Clone, Copy)]
enum QBytes<'a> {
    Arena(ArenaSpan),
    Const(&'a [u8]),
}

#[derive(Clone, Copy)]
enum Queued<'a> {
    Null,
    U32(u32),
    Str(QBytes<'a>),
    Json(QBytes<'a>),
    Bin(QBytes<'a>),
}

#[derive(Clone, Copy)]
struct Message<'a> {
    topic: TopicPath,
    /// The topic's tree node, resolved synchronously in `publish`/
    /// `publish_const` so a full tree is reported to the caller instead of
    /// being discovered -- and silently dropped -- later in `process`.
    node_idx: NodeIdx,
    value: Queued<'a>,
    flags: ValueFlags,
    source: Source,
}

#[derive(Clone, Copy)]
struct TopicNode<'a, const MAX_CHILDREN: usize, const MAX_SUBS: usize> {
    name: [u8; MAX_SEGMENT_LEN],
    name_len: u8,
    parent: Option<NodeIdx>,
    children: [Option<NodeIdx>; MAX_CHILDREN],
    children_len: u8,
    subscribers: [Option<Subscriber>; MAX_SUBS],
    subscribers_len: u8,
    retained: Option<Value<'a>>,
    meta: Option<&'a [u8]>,
}

impl<'a, const MAX_CHILDREN: usize, const MAX_SUBS: usize> TopicNode<'a, MAX_CHILDREN, MAX_SUBS> {
    const EMPTY: Self = TopicNode {
        name: [0u8; MAX_SEGMENT_LEN],
        name_len: 0,
        parent: None,
        children: [None; MAX_CHILDREN],
        children_len: 0,
        subscribers: [None; MAX_SUBS],
        subscribers_len: 0,
        retained: None,
        meta: None,
    };

    fn name_matches(&self, name: &[u8]) -> bool {
        self.name_len as usize == name.len() && &self.name[..name.len()] == name
    }
}

enum TreeError {
    NodeCapacity,
    ChildCapacity,
}

/// A retained-value topic tree plus a bounded message queue and payload
/// arena.
///
/// `MAX_NODES` bounds the whole tree (root included); `MAX_CHILDREN` bounds
/// the fan-out of any single node; `MAX_SUBS` bounds subscribers per node;
/// `MAX_QUEUE` bounds in-flight messages; `ARENA_BYTES` bounds the circular
/// byte arena backing non-CONST pointer payloads (`0` disables them
/// entirely -- every allocation then exceeds half of zero).
pub struct PubSub<
    'a,
    const MAX_NODES: usize,
    const MAX_CHILDREN: usize,
    const MAX_SUBS: usize,
    const MAX_QUEUE: usize,
    const ARENA_BYTES: usize,
> {
    nodes: [TopicNode<'a, MAX_CHILDREN, MAX_SUBS>; MAX_NODES],
    node_count: usize,
    arena: Arena<ARENA_BYTES>,
    queue: RingBuffer<Message<'a>, MAX_QUEUE>,
    on_publish: Option<(fn(usize), usize)>,
    truncated_topic_count: u32,
}

/// A reasonable default sizing: 64 nodes, 8 children and 4 subscribers per
/// node, 16 in-flight messages, 512 bytes of payload arena.
pub type DefaultPubSub<'a> = PubSub<'a, 64, 8, 4, 16, 512>;

impl<
        'a,
        const MAX_NODES: usize,
        const MAX_CHILDREN: usize,
        const MAX_SUBS: usize,
        const MAX_QUEUE: usize,
        const ARENA_BYTES: usize,
    > PubSub<'a, MAX_NODES, MAX_CHILDREN, MAX_SUBS, MAX_QUEUE, ARENA_BYTES>
{
    pub fn new() -> Self {
        let mut nodes = [TopicNode::EMPTY; MAX_NODES];
        nodes[ROOT as usize].parent = None;
        PubSub {
            nodes,
            node_count: 1,
            arena: Arena::new(),
            queue: RingBuffer::new(),
            on_publish: None,
            truncated_topic_count: 0,
        }
    }

    /// Number of topic paths that had to be truncated to fit
    /// [`MAX_TOPIC_LEN`]/[`MAX_SEGMENT_LEN`] so far.
    pub fn truncated_topic_count(&self) -> u32 {
        self.truncated_topic_count
    }

    pub fn register_on_publish(&mut self, hook: fn(usize), user_data: usize) {
        self.on_publish = Some((hook, user_data));
    }

    // --- tree lookup -----------------------------------------------------

    fn find(&self, path: &TopicPath) -> Option<NodeIdx> {
        let mut cur = ROOT;
        for seg in path.segments() {
            let mut next = None;
            let node = &self.nodes[cur as usize];
            for i in 0..node.children_len as usize {
                if let Some(idx) = node.children[i] {
                    if self.nodes[idx as usize].name_matches(seg) {
                        next = Some(idx);
                        break;
                    }
                }
            }
            cur = next?;
        }
        Some(cur)
    }

    fn find_or_create(&mut self, path: &TopicPath) -> Result<NodeIdx, TreeError> {
        if path.was_truncated() {
            self.truncated_topic_count = self.truncated_topic_count.wrapping_add(1);
            dev_warn!("pubsub: topic '{}' was truncated to fit node limits", path.as_str());
        }

        let mut cur = ROOT;
        for seg in path.segments() {
            cur = self.find_or_create_child(cur, seg)?;
        }
        Ok(cur)
    }

    fn find_or_create_child(&mut self, parent: NodeIdx, name: &[u8]) -> Result<NodeIdx, TreeError> {
        let p = parent as usize;
        for i in 0..self.nodes[p].children_len as usize {
            if let Some(idx) = self.nodes[p].children[i] {
                if self.nodes[idx as usize].name_matches(name) {
                    return Ok(idx);
                }
            }
        }

        if self.nodes[p].children_len as usize >= MAX_CHILDREN {
            return Err(TreeError::ChildCapacity);
        }
        if self.node_count >= MAX_NODES {
            return Err(TreeError::NodeCapacity);
        }

        let new_idx = self.node_count as NodeIdx;
        self.node_count += 1;

        let mut node = TopicNode::EMPTY;
        node.parent = Some(parent);
        let n = name.len().min(MAX_SEGMENT_LEN);
        node.name[..n].copy_from_slice(&name[..n]);
        node.name_len = n as u8;
        self.nodes[new_idx as usize] = node;

        let len = self.nodes[p].children_len as usize;
        self.nodes[p].children[len] = Some(new_idx);
        self.nodes[p].children_len += 1;

        Ok(new_idx)
    }

    // --- subscribe / unsubscribe ------------------------------------------

    /// Subscribes `func`/`user_data` to `topic` (created if absent). Unless
    /// `link` is set, every retained value on `topic` or any descendant is
    /// immediately delivered to the new subscriber, in pre-order, before
    /// this call returns. A `link` subscriber receives ordinary future
    /// publishes like any other subscriber but skips this replay -- it is
    /// meant for bridges forwarding metadata traffic between instances, not
    /// for replaying retained application state.
    pub fn subscribe(
        &mut self,
        topic: &str,
        func: SubscriberFn,
        user_data: usize,
        link: bool,
    ) -> Result<(), SubscribeError> {
        let path = TopicPath::parse(topic);
        let node_idx = self.find_or_create(&path).map_err(tree_to_subscribe_err)?;

        let node = &mut self.nodes[node_idx as usize];
        if node.subscribers_len as usize >= MAX_SUBS {
            return Err(SubscribeError::Full);
        }
        let len = node.subscribers_len as usize;
        node.subscribers[len] = Some(Subscriber { func, user_data, link });
        node.subscribers_len += 1;

        if !link {
            self.replay_retained(node_idx, func, user_data);
        }
        Ok(())
    }

    pub fn unsubscribe(&mut self, topic: &str, func: SubscriberFn, user_data: usize) {
        let Some(node_idx) = self.find(&TopicPath::parse(topic)) else { return };
        let node = &mut self.nodes[node_idx as usize];
        let mut write = 0;
        for read in 0..node.subscribers_len as usize {
            let keep = match node.subscribers[read] {
                Some(s) => !(s.func == func && s.user_data == user_data),
                None => false,
            };
            if keep {
                node.subscribers[write] = node.subscribers[read];
                write += 1;
            }
        }
        for slot in node.subscribers[write..node.subscribers_len as usize].iter_mut() {
            *slot = None;
        }
        node.subscribers_len = write as u8;
    }

    /// Pre-order delivery of every retained value at `node_idx` or below to
    /// one freshly-subscribed callback.
    fn replay_retained(&self, node_idx: NodeIdx, func: SubscriberFn, user_data: usize) {
        let node = &self.nodes[node_idx as usize];
        if let Some(value) = node.retained {
            let topic = self.full_path(node_idx);
            let _ = func(user_data, topic.as_str(), value, Source::NONE);
        }
        for i in 0..node.children_len as usize {
            if let Some(child) = node.children[i] {
                self.replay_retained(child, func, user_data);
            }
        }
    }

    /// Reconstructs a node's full slash-separated path by walking to the
    /// root. Only used for retained-value replay, which is not on any
    /// latency-sensitive path.
    fn full_path(&self, node_idx: NodeIdx) -> TopicPath {
        let mut stack: [NodeIdx; MAX_NODES] = [0; MAX_NODES];
        let mut depth = 0;
        let mut cur = node_idx;
        loop {
            stack[depth] = cur;
            depth += 1;
            match self.nodes[cur as usize].parent {
                Some(p) => cur = p,
                None => break,
            }
        }

        let mut buf = [0u8; MAX_TOPIC_LEN];
        let mut len = 0usize;
        for i in (0..depth).rev() {
            let idx = stack[i];
            if idx == ROOT {
                continue;
            }
            let node = &self.nodes[idx as usize];
            if len > 0 {
                buf[len] = b'/';
                len += 1;
            }
            let seg_len = node.name_len as usize;
            buf[len..len + seg_len].copy_from_slice(&node.name[..seg_len]);
            len += seg_len;
        }

        let s = core::str::from_utf8(&buf[..len]).unwrap_or("");
        TopicPath::parse(s)
    }

    // --- query -------------------------------------------------------------

    pub fn query(&self, topic: &str) -> Option<Value<'a>> {
        self.find(&TopicPath::parse(topic)).and_then(|idx| self.nodes[idx as usize].retained)
    }

    /// The metadata JSON blob stored on `topic` by a prior `CONST | RETAIN`
    /// publish to `topic/$`, if any.
    pub fn meta(&self, topic: &str) -> Option<&'a [u8]> {
        self.find(&TopicPath::parse(topic)).and_then(|idx| self.nodes[idx as usize].meta)
    }

    // --- publish -------------------------------------------------------------

    /// Publishes a value whose `Str`/`Json`/`Bin` bytes only need to outlive
    /// this call: they are copied into the arena before `publish` returns.
    /// Rejects `CONST` (use [`PubSub::publish_const`] instead) and rejects
    /// `RETAIN` on a pointer-type value (a non-CONST payload's arena span is
    /// freed right after delivery, so it can never be safely retained).
    /// Resolves (creating if absent) `topic`'s tree node before queuing,
    /// returning [`PublishError::NotEnoughMemory`] synchronously if the tree
    /// has no room left on this path.
    pub fn publish(
        &mut self,
        topic: &str,
        value: Value<'_>,
        flags: ValueFlags,
        source: Source,
    ) -> Result<(), PublishError> {
        if flags.contains(ValueFlags::CONST) {
            return Err(PublishError::ParameterInvalid);
        }
        if flags.contains(ValueFlags::RETAIN) && value.is_bytes() {
            return Err(PublishError::ParameterInvalid);
        }

        let path = TopicPath::parse(topic);
        let node_idx = self.find_or_create(&path).map_err(tree_to_publish_err)?;
        let queued = self.copy_into_arena(value)?;
        self.enqueue(path, node_idx, queued, flags, source)
    }

    /// Publishes a value whose `Str`/`Json`/`Bin` bytes are stored by
    /// pointer rather than copied -- `msg`'s lifetime must cover the whole
    /// `PubSub` instance. Required for `CONST | RETAIN`, since a retained
    /// pointer value is handed to every future subscriber directly from the
    /// caller's memory. Resolves (creating if absent) `topic`'s tree node
    /// before queuing, like [`PubSub::publish`].
    pub fn publish_const(
        &mut self,
        topic: &str,
        value: Value<'a>,
        flags: ValueFlags,
        source: Source,
    ) -> Result<(), PublishError> {
        if value.is_bytes() && !flags.contains(ValueFlags::CONST) {
            return Err(PublishError::ParameterInvalid);
        }

        let path = TopicPath::parse(topic);
        let node_idx = self.find_or_create(&path).map_err(tree_to_publish_err)?;

        let queued = match value {
            Value::Null => Queued::Null,
            Value::U32(v) => Queued::U32(v),
            Value::Str(b) => Queued::Str(QBytes::Const(b)),
            Value::Json(b) => Queued::Json(QBytes::Const(b)),
            Value::Bin(b) => Queued::Bin(QBytes::Const(b)),
        };
        self.enqueue(path, node_idx, queued, flags, source)
    }

    fn copy_into_arena(&mut self, value: Value<'_>) -> Result<Queued<'a>, PublishError> {
        let alloc = |arena: &mut Arena<ARENA_BYTES>, bytes: &[u8]| -> Result<ArenaSpan, PublishError> {
            arena.alloc(bytes).map_err(|e| match e {
                ArenaError::Full => PublishError::Full,
                ArenaError::TooBig => PublishError::TooBig,
            })
        };

        Ok(match value {
            Value::Null => Queued::Null,
            Value::U32(v) => Queued::U32(v),
            Value::Str(b) => Queued::Str(QBytes::Arena(alloc(&mut self.arena, b)?)),
            Value::Json(b) => Queued::Json(QBytes::Arena(alloc(&mut self.arena, b)?)),
            Value::Bin(b) => Queued::Bin(QBytes::Arena(alloc(&mut self.arena, b)?)),
        })
    }

    fn enqueue(
        &mut self,
        topic: TopicPath,
        node_idx: NodeIdx,
        value: Queued<'a>,
        flags: ValueFlags,
        source: Source,
    ) -> Result<(), PublishError> {
        if self.queue.is_full() {
            self.free_queued(value);
            return Err(PublishError::Busy);
        }
        self.queue.push(Message { topic, node_idx, value, flags, source });

        if let Some((hook, user_data)) = self.on_publish {
            hook(user_data);
        }
        Ok(())
    }

    fn free_queued(&mut self, value: Queued<'a>) {
        let free_bytes = |arena: &mut Arena<ARENA_BYTES>, b: QBytes<'a>| {
            if let QBytes::Arena(span) = b {
                arena.free_span(span);
            }
        };
        match value {
            Queued::Null | Queued::U32(_) => {}
            Queued::Str(b) | Queued::Json(b) | Queued::Bin(b) => free_bytes(&mut self.arena, b),
        }
    }

    /// Resolves a queued value to something deliverable right now, borrowed
    /// from `self` for arena-backed bytes. Never used for retained storage:
    /// an arena span's backing bytes are freed as soon as `process` finishes
    /// delivering the message that owns them, so this intentionally cannot
    /// outlive the call it's used in. See [`PubSub::retainable`] for the
    /// separate, narrower conversion that node.retained actually stores.
    fn resolve(&self, value: &Queued<'a>) -> Value<'_> {
        match value {
            Queued::Null => Value::Null,
            Queued::U32(v) => Value::U32(*v),
            Queued::Str(b) => Value::Str(self.resolve_bytes(b)),
            Queued::Json(b) => Value::Json(self.resolve_bytes(b)),
            Queued::Bin(b) => Value::Bin(self.resolve_bytes(b)),
        }
    }

    fn resolve_bytes(&self, b: &QBytes<'a>) -> &[u8] {
        match b {
            QBytes::Arena(span) => self.arena.slice(*span),
            QBytes::Const(s) => s,
        }
    }

    /// Converts a queued value to one that can be safely stored in
    /// `node.retained` (which must outlive `process`): `Null`/`U32` are
    /// trivially `'a`-free, and `Str`/`Json`/`Bin` qualify only when backed
    /// by a `CONST` pointer. An arena-backed bytes value here means
    /// `RETAIN` reached the queue without `CONST` -- `publish` rejects that
    /// combination up front, so this is a defensive `None`, not an expected
    /// path.
    fn retainable(value: &Queued<'a>) -> Option<Value<'a>> {
        Some(match value {
            Queued::Null => Value::Null,
            Queued::U32(v) => Value::U32(*v),
            Queued::Str(QBytes::Const(b)) => Value::Str(b),
            Queued::Json(QBytes::Const(b)) => Value::Json(b),
            Queued::Bin(QBytes::Const(b)) => Value::Bin(b),
            Queued::Str(QBytes::Arena(_)) | Queued::Json(QBytes::Arena(_)) | Queued::Bin(QBytes::Arena(_)) => {
                return None
            }
        })
    }

    // --- process -------------------------------------------------------------

    /// Drains the queue in FIFO order: for each message, installs the
    /// retained value on its (already-resolved) node if any and not a
    /// suppressed duplicate, fans it out from the node up to the root, then
    /// frees its arena span. Re-entrant publishes made from within a
    /// subscriber callback are appended to the queue and drained by this
    /// same call, since a subscriber never receives `&mut PubSub` and so can
    /// only re-enter through its own externally-held handle.
    pub fn process(&mut self) {
        while let Some(msg) = self.queue.poll_first() {
            // The node was already resolved synchronously in `publish`/
            // `publish_const`; a full tree is reported to the caller there
            // instead of silently dropping the message here.
            let node_idx = msg.node_idx;

            if msg.topic.is_meta() {
                self.process_meta_message(node_idx, &msg);
                self.free_queued(msg.value);
                continue;
            }

            let retain = msg.flags.contains(ValueFlags::RETAIN);
            if retain {
                match Self::retainable(&msg.value) {
                    Some(value) => {
                        let suppress = self.nodes[node_idx as usize].retained == Some(value);
                        if !suppress {
                            self.nodes[node_idx as usize].retained = Some(value);
                            let view = self.resolve(&msg.value);
                            self.fan_out(node_idx, msg.topic.as_str(), view, msg.source);
                        }
                    }
                    None => dev_warn!(
                        "pubsub: retained publish on '{}' carried a non-retainable value, dropping",
                        msg.topic.as_str()
                    ),
                }
            } else {
                let view = self.resolve(&msg.value);
                self.fan_out(node_idx, msg.topic.as_str(), view, msg.source);
            }

            self.free_queued(msg.value);
        }
    }

    fn process_meta_message(&mut self, dollar_idx: NodeIdx, msg: &Message<'a>) {
        let Some(target) = msg.topic.meta_target() else { return };
        let Ok(target_idx) = self.find_or_create(&target) else { return };

        match msg.value {
            Queued::Null => {
                // A request to re-broadcast the target's metadata: resend
                // the stored blob (if any) to `$`'s subscribers without
                // touching retained state.
                if let Some(meta) = self.nodes[target_idx as usize].meta {
                    self.fan_out(dollar_idx, msg.topic.as_str(), Value::Json(meta), msg.source);
                }
            }
            Queued::Json(QBytes::Const(bytes)) if msg.flags.contains(ValueFlags::RETAIN | ValueFlags::CONST) => {
                self.nodes[target_idx as usize].meta = Some(bytes);
                self.nodes[dollar_idx as usize].retained = Some(Value::Json(bytes));
                self.fan_out(dollar_idx, msg.topic.as_str(), Value::Json(bytes), msg.source);
            }
            _ => {
                dev_warn!("pubsub: malformed metadata publish on '{}' ignored", msg.topic.as_str());
            }
        }
    }

    /// Invokes every subscriber from `node_idx` up to the root, skipping
    /// `source`. The subscriber list is copied out first so a re-entrant
    /// `subscribe`/`unsubscribe` made from within a callback cannot corrupt
    /// the walk in progress.
    fn fan_out(&self, node_idx: NodeIdx, topic: &str, value: Value<'_>, source: Source) {
        let mut cur = Some(node_idx);
        while let Some(idx) = cur {
            let subs = self.nodes[idx as usize].subscribers;
            let subs_len = self.nodes[idx as usize].subscribers_len as usize;
            for sub in subs[..subs_len].iter().flatten() {
                let sub_source = Source { func: Some(sub.func), user_data: sub.user_data };
                if sub_source == source {
                    continue;
                }
                let rc = (sub.func)(sub.user_data, topic, value, source);
                if rc != 0 {
                    dev_warn!("pubsub: subscriber on '{}' returned {}", topic, rc);
                }
            }
            cur = self.nodes[idx as usize].parent;
        }
    }
}

impl<
        'a,
        const MAX_NODES: usize,
        const MAX_CHILDREN: usize,
        const MAX_SUBS: usize,
        const MAX_QUEUE: usize,
        const ARENA_BYTES: usize,
    > Default for PubSub<'a, MAX_NODES, MAX_CHILDREN, MAX_SUBS, MAX_QUEUE, ARENA_BYTES>
{
    fn default() -> Self {
        Self::new()
    }
}

fn tree_to_subscribe_err(e: TreeError) -> SubscribeError {
    match e {
        TreeError::NodeCapacity | TreeError::ChildCapacity => SubscribeError::NotEnoughMemory,
    }
}

fn tree_to_publish_err(e: TreeError) -> PublishError {
    match e {
        TreeError::NodeCapacity | TreeError::ChildCapacity => PublishError::NotEnoughMemory,
    }
}
