use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rvm_class::{ClassDescriptor, ClassId, LoaderId};
use std::cmp::Reverse;
use std::fmt::{Display, Formatter};
use tracing::debug;

/// One evicted class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnloadEvent {
	pub cycle: u64,
	pub class: ClassId,
	pub name: String,
	pub kind: UnloadKind,
	pub loader: LoaderId,
}

impl UnloadEvent {
	pub fn new(cycle: u64, class: &ClassDescriptor) -> UnloadEvent {
		UnloadEvent {
			cycle,
			class: class.id(),
			name: class.name().to_string(),
			kind: match class.dimensions() {
				0 => UnloadKind::Ordinary,
				dimensions => UnloadKind::Array { dimensions },
			},
			loader: class.loader(),
		}
	}

	/// Arrays before their components: higher dimensionality first, then insertion order.
	pub(crate) fn order_key(class: &ClassDescriptor) -> (Reverse<u8>, ClassId) {
		(Reverse(class.dimensions()), class.id())
	}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnloadKind {
	Ordinary,
	Array { dimensions: u8 },
}

impl Display for UnloadKind {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			UnloadKind::Ordinary => f.write_str("class"),
			UnloadKind::Array { dimensions } => write!(f, "array class[{dimensions}]"),
		}
	}
}

#[derive(Default)]
pub(crate) struct EventPublisher {
	subscribers: Mutex<Vec<Sender<UnloadEvent>>>,
}

impl EventPublisher {
	pub(crate) fn subscribe(&self) -> Receiver<UnloadEvent> {
		let (sender, receiver) = unbounded();
		self.subscribers.lock().push(sender);
		receiver
	}

	pub(crate) fn publish(&self, event: &UnloadEvent) {
		debug!(
			target: "class_unload",
			"unloading {} {} {} in cycle {}",
			event.kind,
			event.name,
			event.loader,
			event.cycle
		);
		// Subscribers that hung up are forgotten.
		self.subscribers
			.lock()
			.retain(|subscriber| subscriber.send(event.clone()).is_ok());
	}
}
