//! Ordered, priority-sorted hook pipeline.
//!
//! One [`HookPipeline`] per proxy instance maps every `(direction, packet
//! type)` pair to an ordered list of hooks. Hooks fire lowest priority
//! first, ties resolved by registration order, and every handler completes
//! (including any awaited work) before the next one starts.
//!
//! The lists are intrusive doubly-linked chains of [`Hook`] nodes. The
//! traversal captures a node's successor *before* running its handler, so a
//! handler may unregister the current node (or any other) without skipping
//! or revisiting entries, and hooks inserted at positions the cursor has not
//! yet reached are picked up within the same pass.

use crate::error::EventError;
use crate::events::{Direction, Event, EventAction};
use async_trait::async_trait;
use compact_str::CompactString;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Priority used by [`HookPipeline::register`]. Lower priorities run first.
pub const DEFAULT_HOOK_PRIORITY: i32 = 100;

/// A registered packet interceptor.
///
/// Handlers may mutate `event.data` in place; whatever is left in the
/// payload is what gets forwarded when the pipeline allows it.
#[async_trait]
pub trait PacketHook: Send + Sync {
    async fn handle(&self, event: &mut Event) -> Result<EventAction, EventError>;
}

struct SyncHook<F>(F);

#[async_trait]
impl<F> PacketHook for SyncHook<F>
where
    F: Fn(&mut Event) -> Result<EventAction, EventError> + Send + Sync,
{
    async fn handle(&self, event: &mut Event) -> Result<EventAction, EventError> {
        (self.0)(event)
    }
}

/// Wraps a synchronous closure as a hook handler. Most observers and
/// cancel-only hooks need no awaiting and read better this way.
pub fn sync_hook<F>(f: F) -> Arc<dyn PacketHook>
where
    F: Fn(&mut Event) -> Result<EventAction, EventError> + Send + Sync + 'static,
{
    Arc::new(SyncHook(f))
}

struct FnHook<F>(F);

#[async_trait]
impl<F> PacketHook for FnHook<F>
where
    F: for<'a> Fn(&'a mut Event) -> BoxFuture<'a, Result<EventAction, EventError>>
        + Send
        + Sync,
{
    async fn handle(&self, event: &mut Event) -> Result<EventAction, EventError> {
        (self.0)(event).await
    }
}

/// Wraps a boxed-future function as a hook handler. Useful for free
/// functions; stateful async hooks usually implement [`PacketHook`] on a
/// struct instead.
pub fn hook_fn<F>(f: F) -> Arc<dyn PacketHook>
where
    F: for<'a> Fn(&'a mut Event) -> BoxFuture<'a, Result<EventAction, EventError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnHook(f))
}

/// Membership node in exactly one hook list.
///
/// Keep the `Arc<Hook>` returned by registration around: it is the handle
/// for [`HookPipeline::unregister`], and owning modules release their hooks
/// through it on unload.
pub struct Hook {
    scope: Direction,
    kind: CompactString,
    priority: i32,
    handler: Arc<dyn PacketHook>,
    removed: AtomicBool,
    links: Mutex<HookLinks>,
}

#[derive(Default)]
struct HookLinks {
    prev: Weak<Hook>,
    next: Option<Arc<Hook>>,
}

impl Hook {
    pub fn scope(&self) -> Direction {
        self.scope
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    fn next(&self) -> Option<Arc<Hook>> {
        self.links.lock().expect("hook links poisoned").next.clone()
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("scope", &self.scope)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("removed", &self.is_removed())
            .finish()
    }
}

#[derive(Default)]
struct HookList {
    head: Option<Arc<Hook>>,
    tail: Option<Arc<Hook>>,
    len: usize,
}

/// Counters kept by the pipeline for monitoring.
#[derive(Debug, Default)]
pub struct PipelineStats {
    registered: AtomicU64,
    executions: AtomicU64,
    cancelled: AtomicU64,
    handler_failures: AtomicU64,
}

impl PipelineStats {
    pub fn registered(&self) -> u64 {
        self.registered.load(Ordering::Relaxed)
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }
}

/// The per-proxy hook table.
#[derive(Default)]
pub struct HookPipeline {
    table: DashMap<(Direction, CompactString), Mutex<HookList>>,
    stats: PipelineStats,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook at [`DEFAULT_HOOK_PRIORITY`].
    pub fn register(
        &self,
        scope: Direction,
        kind: &str,
        handler: Arc<dyn PacketHook>,
    ) -> Arc<Hook> {
        self.register_with_priority(scope, kind, DEFAULT_HOOK_PRIORITY, handler)
    }

    /// Registers a hook on the `(scope, kind)` list, creating the list if
    /// absent. The new hook lands after every existing hook of priority
    /// `<= priority` and before every hook of higher priority, so lower
    /// priorities fire first and equal priorities keep registration order.
    pub fn register_with_priority(
        &self,
        scope: Direction,
        kind: &str,
        priority: i32,
        handler: Arc<dyn PacketHook>,
    ) -> Arc<Hook> {
        let hook = Arc::new(Hook {
            scope,
            kind: CompactString::new(kind),
            priority,
            handler,
            removed: AtomicBool::new(false),
            links: Mutex::new(HookLinks::default()),
        });

        let entry = self
            .table
            .entry((scope, hook.kind.clone()))
            .or_default();
        let mut list = entry.lock().expect("hook list poisoned");

        // Last node whose priority is <= the new one; the hook goes after it.
        let mut after: Option<Arc<Hook>> = None;
        let mut cursor = list.head.clone();
        while let Some(node) = cursor {
            if node.priority <= priority {
                cursor = node.next();
                after = Some(node);
            } else {
                break;
            }
        }

        match after {
            None => {
                hook.links.lock().expect("hook links poisoned").next = list.head.clone();
                if let Some(old_head) = &list.head {
                    old_head.links.lock().expect("hook links poisoned").prev =
                        Arc::downgrade(&hook);
                }
                if list.head.is_none() {
                    list.tail = Some(hook.clone());
                }
                list.head = Some(hook.clone());
            }
            Some(node) => {
                let next = {
                    let mut node_links = node.links.lock().expect("hook links poisoned");
                    let next = node_links.next.take();
                    node_links.next = Some(hook.clone());
                    next
                };
                {
                    let mut links = hook.links.lock().expect("hook links poisoned");
                    links.prev = Arc::downgrade(&node);
                    links.next = next.clone();
                }
                match next {
                    Some(n) => {
                        n.links.lock().expect("hook links poisoned").prev = Arc::downgrade(&hook)
                    }
                    None => list.tail = Some(hook.clone()),
                }
            }
        }

        list.len += 1;
        self.stats.registered.fetch_add(1, Ordering::Relaxed);
        hook
    }

    /// Splices a hook out of its list in O(1).
    ///
    /// The node keeps its own forward pointer, so a traversal that already
    /// captured it continues past it without rerunning its handler.
    pub fn unregister(&self, hook: &Arc<Hook>) -> Result<(), EventError> {
        if hook.removed.swap(true, Ordering::SeqCst) {
            return Err(EventError::UnknownHook);
        }

        let entry = self
            .table
            .get(&(hook.scope, hook.kind.clone()))
            .ok_or(EventError::UnknownHook)?;
        let mut list = entry.lock().expect("hook list poisoned");

        let (prev, next) = {
            let links = hook.links.lock().expect("hook links poisoned");
            (links.prev.upgrade(), links.next.clone())
        };

        match &prev {
            Some(p) => p.links.lock().expect("hook links poisoned").next = next.clone(),
            None => list.head = next.clone(),
        }
        match &next {
            Some(n) => {
                n.links.lock().expect("hook links poisoned").prev = match &prev {
                    Some(p) => Arc::downgrade(p),
                    None => Weak::new(),
                }
            }
            None => list.tail = prev.clone(),
        }

        list.len -= 1;
        Ok(())
    }

    /// Runs the `(direction, kind)` list against the event, awaiting each
    /// handler before advancing.
    ///
    /// Returns `Ok(true)` when the packet may be forwarded (list empty, all
    /// hooks continued, or a hook answered [`EventAction::CancelHooks`]) and
    /// `Ok(false)` when a hook cancelled it. A handler error aborts the
    /// traversal and propagates; the packet is not forwarded.
    pub async fn execute(&self, event: &mut Event) -> Result<bool, EventError> {
        self.stats.executions.fetch_add(1, Ordering::Relaxed);

        let head = match self
            .table
            .get(&(event.direction(), CompactString::new(event.kind())))
        {
            Some(entry) => entry.lock().expect("hook list poisoned").head.clone(),
            None => return Ok(true),
        };

        let mut cursor = head;
        while let Some(hook) = cursor {
            // Captured before the handler runs; see module docs.
            let next = hook.next();

            if !hook.removed.load(Ordering::SeqCst) {
                let action = match hook.handler.handle(event).await {
                    Ok(action) => action,
                    Err(e) => {
                        self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                        return Err(e);
                    }
                };
                match action {
                    EventAction::Continue => {}
                    EventAction::CancelHooks => return Ok(true),
                    EventAction::Cancel => {
                        self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                        return Ok(false);
                    }
                }
            }

            cursor = next;
        }

        Ok(true)
    }

    /// Number of live hooks on a list.
    pub fn hook_count(&self, scope: Direction, kind: &str) -> usize {
        self.table
            .get(&(scope, CompactString::new(kind)))
            .map(|entry| entry.lock().expect("hook list poisoned").len)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }
}
