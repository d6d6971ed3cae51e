//! Mapping events and entity callbacks.
//!
//! A [`Template`](crate::template::Template) publishes an [`Event`] to its [`EventListener`]s at
//! each stage of reading and writing an entity. Listeners observe; they cannot change what is
//! stored. Entity callbacks, registered in [`Callbacks`], run at the same stages of a write and may
//! replace the entity before it is converted or stored.

use crate::client::Tuple;
use crate::mapping::Entity;
use chrono::{DateTime, Utc};
use derive_more::Display;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// The stage of an operation at which an event is published.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// An entity is about to be converted to a tuple.
    #[display(fmt = "onBeforeConvert")]
    BeforeConvert,
    /// An entity has been converted and is about to be stored.
    #[display(fmt = "onBeforeSave")]
    BeforeSave,
    /// An entity has been stored.
    #[display(fmt = "onAfterSave")]
    AfterSave,
    /// A tuple has been read and is about to be converted to an entity.
    #[display(fmt = "onAfterLoad")]
    AfterLoad,
    /// A tuple has been converted to an entity.
    #[display(fmt = "onAfterConvert")]
    AfterConvert,
    /// A tuple has been deleted.
    #[display(fmt = "onAfterDelete")]
    AfterDelete,
}

/// An event in the life of an entity.
#[derive(Clone, Copy)]
pub struct Event<'a> {
    pub kind: EventKind,
    /// The space being read or written.
    pub space: &'a str,
    /// The name of the entity type.
    pub type_name: &'static str,
    entity: Option<&'a dyn Any>,
    /// The tuple, for events raised after conversion to or before conversion from a tuple.
    pub tuple: Option<&'a Tuple>,
}

impl<'a> Event<'a> {
    fn new<T: 'static>(kind: EventKind, space: &'a str) -> Self {
        Self {
            kind,
            space,
            type_name: std::any::type_name::<T>(),
            entity: None,
            tuple: None,
        }
    }

    pub fn before_convert<T: 'static>(space: &'a str, entity: &'a T) -> Self {
        Self {
            entity: Some(entity),
            ..Self::new::<T>(EventKind::BeforeConvert, space)
        }
    }

    pub fn before_save<T: 'static>(space: &'a str, entity: &'a T, tuple: &'a Tuple) -> Self {
        Self {
            entity: Some(entity),
            tuple: Some(tuple),
            ..Self::new::<T>(EventKind::BeforeSave, space)
        }
    }

    pub fn after_save<T: 'static>(space: &'a str, entity: &'a T, tuple: &'a Tuple) -> Self {
        Self {
            entity: Some(entity),
            tuple: Some(tuple),
            ..Self::new::<T>(EventKind::AfterSave, space)
        }
    }

    pub fn after_load<T: 'static>(space: &'a str, tuple: &'a Tuple) -> Self {
        Self {
            tuple: Some(tuple),
            ..Self::new::<T>(EventKind::AfterLoad, space)
        }
    }

    pub fn after_convert<T: 'static>(space: &'a str, tuple: &'a Tuple, entity: &'a T) -> Self {
        Self {
            entity: Some(entity),
            tuple: Some(tuple),
            ..Self::new::<T>(EventKind::AfterConvert, space)
        }
    }

    pub fn after_delete<T: 'static>(space: &'a str, tuple: &'a Tuple) -> Self {
        Self {
            tuple: Some(tuple),
            ..Self::new::<T>(EventKind::AfterDelete, space)
        }
    }

    /// The entity this event is about, if it is available and of type `T`.
    pub fn entity<T: 'static>(&self) -> Option<&'a T> {
        self.entity?.downcast_ref()
    }
}

/// A receiver of mapping events.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F: Fn(&Event) + Send + Sync> EventListener for F {
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

/// An [`EventListener`] which logs every event at debug level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &Event) {
        match event.tuple {
            Some(tuple) => tracing::debug!(
                "{}({}, {}, {:?})",
                event.kind,
                event.type_name,
                event.space,
                tuple
            ),
            None => tracing::debug!("{}({}, {})", event.kind, event.type_name, event.space),
        }
    }
}

/// Invoked before an entity is converted to a tuple. Returns the entity to convert.
pub trait BeforeConvertCallback<T>: Send + Sync {
    fn on_before_convert(&self, entity: T, space: &str) -> T;
}

impl<T, F: Fn(T, &str) -> T + Send + Sync> BeforeConvertCallback<T> for F {
    fn on_before_convert(&self, entity: T, space: &str) -> T {
        self(entity, space)
    }
}

/// Invoked after an entity has been converted to `tuple`, before it is stored. Returns the entity
/// to report as saved.
pub trait BeforeSaveCallback<T>: Send + Sync {
    fn on_before_save(&self, entity: T, tuple: &Tuple, space: &str) -> T;
}

impl<T, F: Fn(T, &Tuple, &str) -> T + Send + Sync> BeforeSaveCallback<T> for F {
    fn on_before_save(&self, entity: T, tuple: &Tuple, space: &str) -> T {
        self(entity, tuple, space)
    }
}

type BeforeConvertFn<T> = Arc<dyn BeforeConvertCallback<T>>;
type BeforeSaveFn<T> = Arc<dyn BeforeSaveCallback<T>>;

/// Entity callbacks, keyed by entity type.
///
/// Callbacks for the same type run in the order they were registered.
#[derive(Default)]
pub struct Callbacks {
    before_convert: HashMap<TypeId, Vec<Box<dyn Any + Send + Sync>>>,
    before_save: HashMap<TypeId, Vec<Box<dyn Any + Send + Sync>>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked before entities of type `T` are converted.
    pub fn on_before_convert<T: 'static>(
        &mut self,
        callback: impl BeforeConvertCallback<T> + 'static,
    ) -> &mut Self {
        let callback: BeforeConvertFn<T> = Arc::new(callback);
        self.before_convert
            .entry(TypeId::of::<T>())
            .or_default()
            .push(Box::new(callback));
        self
    }

    /// Register a callback invoked before entities of type `T` are stored.
    pub fn on_before_save<T: 'static>(
        &mut self,
        callback: impl BeforeSaveCallback<T> + 'static,
    ) -> &mut Self {
        let callback: BeforeSaveFn<T> = Arc::new(callback);
        self.before_save
            .entry(TypeId::of::<T>())
            .or_default()
            .push(Box::new(callback));
        self
    }

    /// Stamp entities of type `T` with creation and modification times.
    pub fn with_auditing<T: Entity + Auditable>(&mut self) -> &mut Self {
        self.on_before_convert::<T>(AuditingCallback)
    }

    pub(crate) fn before_convert<T: 'static>(&self, entity: T, space: &str) -> T {
        self.before_convert
            .get(&TypeId::of::<T>())
            .into_iter()
            .flatten()
            .filter_map(|cb| cb.downcast_ref::<BeforeConvertFn<T>>())
            .fold(entity, |entity, cb| cb.on_before_convert(entity, space))
    }

    pub(crate) fn before_save<T: 'static>(&self, entity: T, tuple: &Tuple, space: &str) -> T {
        self.before_save
            .get(&TypeId::of::<T>())
            .into_iter()
            .flatten()
            .filter_map(|cb| cb.downcast_ref::<BeforeSaveFn<T>>())
            .fold(entity, |entity, cb| cb.on_before_save(entity, tuple, space))
    }
}

/// An entity which records when it was created and last modified.
pub trait Auditable {
    fn mark_created(&mut self, at: DateTime<Utc>);
    fn mark_modified(&mut self, at: DateTime<Utc>);
}

/// Marks new entities as created and existing entities as modified, at the current time.
#[derive(Clone, Copy, Debug, Default)]
pub struct AuditingCallback;

impl<T: Entity + Auditable> BeforeConvertCallback<T> for AuditingCallback {
    fn on_before_convert(&self, mut entity: T, _space: &str) -> T {
        let now = Utc::now();
        if entity.is_new() {
            entity.mark_created(now);
        } else {
            entity.mark_modified(now);
        }
        entity
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Entity;
    use rmpv::Value;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Entity)]
    struct Note {
        #[entity(id)]
        id: u64,
        text: String,
        created: Option<DateTime<Utc>>,
        modified: Option<DateTime<Utc>>,
    }

    impl Auditable for Note {
        fn mark_created(&mut self, at: DateTime<Utc>) {
            self.created = Some(at);
        }

        fn mark_modified(&mut self, at: DateTime<Utc>) {
            self.modified = Some(at);
        }
    }

    #[test]
    fn test_callback_order() {
        let mut callbacks = Callbacks::new();
        callbacks
            .on_before_convert::<Note>(|mut note: Note, _: &str| {
                note.text.push('a');
                note
            })
            .on_before_convert::<Note>(|mut note: Note, space: &str| {
                note.text.push_str(space);
                note
            })
            .on_before_convert::<u64>(|n: u64, _: &str| n + 1);

        let note = callbacks.before_convert(Note::default(), "notes");
        assert_eq!(note.text, "anotes");
        assert_eq!(callbacks.before_convert(1u64, "numbers"), 2);
        assert_eq!(callbacks.before_convert(1i64, "numbers"), 1);
    }

    #[test]
    fn test_before_save() {
        let mut callbacks = Callbacks::new();
        callbacks.on_before_save::<Note>(|mut note: Note, tuple: &Tuple, _: &str| {
            note.text = tuple.len().to_string();
            note
        });
        let note = callbacks.before_save(Note::default(), &vec![Value::Nil; 4], "notes");
        assert_eq!(note.text, "4");
    }

    #[test]
    fn test_auditing() {
        let mut callbacks = Callbacks::new();
        callbacks.with_auditing::<Note>();

        let created = callbacks.before_convert(Note::default(), "note");
        assert!(created.created.is_some());
        assert!(created.modified.is_none());

        let modified = callbacks.before_convert(
            Note {
                id: 1,
                ..Default::default()
            },
            "note",
        );
        assert!(modified.created.is_none());
        assert!(modified.modified.is_some());
    }

    #[test]
    fn test_listener() {
        let seen = Arc::new(Mutex::new(vec![]));
        let listener = {
            let seen = seen.clone();
            move |event: &Event| {
                let id = event.entity::<Note>().map(|note| note.id);
                seen.lock().unwrap().push((event.kind, event.space.to_string(), id));
            }
        };

        let note = Note {
            id: 3,
            ..Default::default()
        };
        let tuple = vec![Value::from(3)];
        listener.on_event(&Event::before_convert("note", &note));
        listener.on_event(&Event::after_delete::<Note>("note", &tuple));
        LoggingEventListener.on_event(&Event::after_load::<Note>("note", &tuple));

        assert_eq!(
            *seen.lock().unwrap(),
            [
                (EventKind::BeforeConvert, "note".to_string(), Some(3)),
                (EventKind::AfterDelete, "note".to_string(), None),
            ]
        );
    }
}
