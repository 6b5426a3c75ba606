//! The watch bus: one actor task owning all subscription state, reached
//! through two channels — `cmd_tx` for control requests and `event_tx`
//! for lifecycle notifications from the Storage Engine. No lock is ever
//! taken on subscriber state; everything happens inside the actor's
//! `select!` loop, by construction.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::key::{TypeId, TypeTag};
use crate::record::TypedObject;

pub type SubscriberId = Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

/// `{ kind, typeId, object, previous? }`. `object` is always a defensive
/// clone; `previous` is populated only for `Updated`.
pub struct WatchEvent {
    pub kind: EventKind,
    pub type_id: TypeId,
    pub object: Box<dyn TypedObject>,
    pub previous: Option<Box<dyn TypedObject>>,
}

impl Clone for WatchEvent {
    fn clone(&self) -> Self {
        WatchEvent {
            kind: self.kind,
            type_id: self.type_id,
            object: self.object.clone_box(),
            previous: self.previous.as_ref().map(|p| p.clone_box()),
        }
    }
}

enum Command {
    Watch {
        subscriber_id: Option<SubscriberId>,
        delivery: Option<mpsc::Sender<WatchEvent>>,
        add_tags: Vec<TypeTag>,
        add_ids: Vec<TypeId>,
        reply: oneshot::Sender<SubscriberId>,
    },
    Unwatch {
        subscriber_id: SubscriberId,
        remove_tags: Vec<TypeTag>,
        remove_ids: Vec<TypeId>,
    },
    Remove {
        subscriber_id: SubscriberId,
    },
}

struct Subscriber {
    delivery: mpsc::Sender<WatchEvent>,
    tags: HashSet<TypeTag>,
    ids: HashSet<TypeId>,
}

/// Handle to the running actor; cheap to clone, `Send + Sync`.
#[derive(Clone)]
pub struct WatchBus {
    cmd_tx: mpsc::Sender<Command>,
    event_tx: mpsc::Sender<WatchEvent>,
}

impl WatchBus {
    /// Spawns the actor task and returns a handle to it. The task runs
    /// until both channels are dropped.
    pub fn spawn() -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(64);
        let (event_tx, mut event_rx) = mpsc::channel::<WatchEvent>(256);

        tokio::spawn(async move {
            let mut subscribers: HashMap<SubscriberId, Subscriber> = HashMap::new();
            loop {
                tokio::select! {
                    biased;
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            Some(cmd) => handle_cmd(&mut subscribers, cmd),
                            None => break,
                        }
                    }
                    ev = event_rx.recv() => {
                        match ev {
                            Some(ev) => handle_event(&mut subscribers, ev).await,
                            None => break,
                        }
                    }
                }
            }
            // closeAll: drop every subscriber's sender, which closes their
            // receiving ends.
            subscribers.clear();
        });

        WatchBus { cmd_tx, event_tx }
    }

    /// `watch(subscriberId, deliveryCh, +tags, +ids)`. Pass `None` for
    /// `subscriber_id` to allocate a new one (requires `delivery` to be
    /// `Some`); pass `Some` to extend an existing subscriber's filters.
    pub async fn watch(
        &self,
        subscriber_id: Option<SubscriberId>,
        delivery: Option<mpsc::Sender<WatchEvent>>,
        add_tags: Vec<TypeTag>,
        add_ids: Vec<TypeId>,
    ) -> SubscriberId {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Command::Watch {
                subscriber_id,
                delivery,
                add_tags,
                add_ids,
                reply: reply_tx,
            })
            .await;
        reply_rx.await.expect("watch bus actor is alive")
    }

    /// `unwatch(subscriberId, -tags, -ids)`. Empty lists are a no-op.
    pub async fn unwatch(&self, subscriber_id: SubscriberId, remove_tags: Vec<TypeTag>, remove_ids: Vec<TypeId>) {
        let _ = self
            .cmd_tx
            .send(Command::Unwatch {
                subscriber_id,
                remove_tags,
                remove_ids,
            })
            .await;
    }

    /// `remove(subscriberId)`: close the delivery channel, forget the subscriber.
    pub async fn remove(&self, subscriber_id: SubscriberId) {
        let _ = self.cmd_tx.send(Command::Remove { subscriber_id }).await;
    }

    /// Publish a lifecycle event. Blocks (backpressures the caller) if the
    /// actor's event queue is full — see the bounded-blocking-delivery
    /// policy recorded for this rewrite.
    pub async fn publish(&self, event: WatchEvent) {
        let _ = self.event_tx.send(event).await;
    }
}

fn handle_cmd(subscribers: &mut HashMap<SubscriberId, Subscriber>, cmd: Command) {
    match cmd {
        Command::Watch {
            subscriber_id,
            delivery,
            add_tags,
            add_ids,
            reply,
        } => {
            let id = match subscriber_id {
                Some(id) => id,
                None => Uuid::new_v4(),
            };
            let sub = subscribers.entry(id).or_insert_with(|| Subscriber {
                delivery: delivery.expect("new subscriber must supply a delivery channel"),
                tags: HashSet::new(),
                ids: HashSet::new(),
            });
            sub.tags.extend(add_tags);
            sub.ids.extend(add_ids);
            let _ = reply.send(id);
        }
        Command::Unwatch {
            subscriber_id,
            remove_tags,
            remove_ids,
        } => {
            if let Some(sub) = subscribers.get_mut(&subscriber_id) {
                for t in remove_tags {
                    sub.tags.remove(&t);
                }
                for i in remove_ids {
                    sub.ids.remove(&i);
                }
            }
        }
        Command::Remove { subscriber_id } => {
            subscribers.remove(&subscriber_id);
        }
    }
}

async fn handle_event(subscribers: &mut HashMap<SubscriberId, Subscriber>, event: WatchEvent) {
    // OR-match dispatch: deliver if the event's tag matches a watched tag,
    // or its full id matches a watched id.
    for sub in subscribers.values() {
        let matches = sub.tags.contains(&event.type_id.tag()) || sub.ids.contains(&event.type_id);
        if matches {
            // Blocking send: a slow subscriber backpressures the whole bus.
            let _ = sub.delivery.send(event.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use crate::record::{test_fixtures::TestObject, StaticObject};

    fn dummy_event(tag: TypeTag, kind: EventKind) -> WatchEvent {
        let type_id = TypeId::new(tag, [7u8; 16]);
        let mut obj = TestObject::default();
        obj.metadata = Some(Metadata::new(tag, [7u8; 16]));
        WatchEvent {
            kind,
            type_id,
            object: Box::new(StaticObject::new(obj)),
            previous: None,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_matching_events_in_order() {
        let bus = WatchBus::spawn();
        let (tx, mut rx) = mpsc::channel(16);
        let tag = TypeTag([1, 2, 3, 4]);
        let id = bus.watch(None, Some(tx), vec![tag], vec![]).await;

        for _ in 0..3 {
            bus.publish(dummy_event(tag, EventKind::Created)).await;
        }
        bus.publish(dummy_event(TypeTag([9, 9, 9, 9]), EventKind::Created)).await;

        for _ in 0..3 {
            let ev = rx.recv().await.unwrap();
            assert_eq!(ev.kind, EventKind::Created);
        }
        bus.remove(id).await;
    }
}
