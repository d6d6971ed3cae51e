//! Entity-level operations on top of a [`Client`].
//!
//! A [`Template`] knows how to turn entities into tuples and back, using the space metadata reported
//! by the client. It runs the registered entity [callbacks](crate::event::Callbacks) and publishes
//! [events](crate::event::Event) around each conversion, and translates client errors into
//! [`Error`].
//!
//! All operations are asynchronous. The [`blocking`] module has a synchronous wrapper.

use crate::client::{Client, Error as _, IndexMetadata, SpaceMetadata, Tuple};
use crate::convert::{self, from_readable, update_operations};
use crate::error::{Error, Result};
use crate::event::{Callbacks, Event, EventListener};
use crate::mapping::{entity_key, key_of, Entity};
use crate::query::Conditions;
use derivative::Derivative;
use futures::{
    future::try_join_all,
    stream::{self, Stream, StreamExt, TryStreamExt},
};
use rmpv::Value;
use serde::de::DeserializeOwned;
use std::sync::Arc;

pub mod blocking;

/// Entity operations over a client.
#[derive(Derivative)]
#[derivative(Clone(bound = "C: Clone"), Debug(bound = "C: std::fmt::Debug"))]
pub struct Template<C> {
    client: C,
    #[derivative(Debug = "ignore")]
    listeners: Vec<Arc<dyn EventListener>>,
    #[derivative(Debug = "ignore")]
    callbacks: Arc<Callbacks>,
}

impl<C: Client> Template<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            listeners: vec![],
            callbacks: Default::default(),
        }
    }

    /// Publish events to `listener`.
    pub fn with_listener(mut self, listener: impl EventListener + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Run `callbacks` when writing entities.
    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = Arc::new(callbacks);
        self
    }

    /// The underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Whether the underlying client routes operations through `crud` functions.
    pub fn is_proxy(&self) -> bool {
        self.client.is_proxy()
    }

    /// The metadata of the space storing `T`.
    pub async fn metadata<T: Entity>(&self) -> Result<SpaceMetadata> {
        self.client
            .space(T::space())
            .await
            .map_err(Error::translate)?
            .ok_or_else(|| Error::missing_space(T::space()))
    }

    /// Get the entity with primary key `id`.
    pub async fn select_by_id<T: Entity>(&self, id: &T::Id) -> Result<Option<T>> {
        let key = key_of::<T>(id)?;
        self.select_one(&Conditions::primary_key(key)).await
    }

    /// Get the entities with the given primary keys.
    ///
    /// The lookups run concurrently. Ids which do not exist are skipped.
    pub async fn select_by_ids<T: Entity>(&self, ids: &[T::Id]) -> Result<Vec<T>> {
        let found = try_join_all(ids.iter().map(|id| self.select_by_id::<T>(id))).await?;
        Ok(found.into_iter().flatten().collect())
    }

    /// Get the first entity matching `conditions`.
    pub async fn select_one<T: Entity>(&self, conditions: &Conditions) -> Result<Option<T>> {
        let space = self.metadata::<T>().await?;
        let tuples = self.select_tuples(&space, conditions).await?;
        tuples
            .into_iter()
            .next()
            .map(|tuple| self.to_entity(tuple, &space))
            .transpose()
    }

    /// Get all entities matching `conditions`.
    pub async fn select<T: Entity>(&self, conditions: &Conditions) -> Result<Vec<T>> {
        let space = self.metadata::<T>().await?;
        self.select_tuples(&space, conditions)
            .await?
            .into_iter()
            .map(|tuple| self.to_entity(tuple, &space))
            .collect()
    }

    /// Get all entities in the space.
    pub async fn select_all<T: Entity>(&self) -> Result<Vec<T>> {
        self.select(&Conditions::any()).await
    }

    /// Stream the entities matching `conditions`.
    pub fn select_stream<T: Entity>(
        &self,
        conditions: Conditions,
    ) -> impl Stream<Item = Result<T>> + Send + '_ {
        stream::once(async move {
            let space = self.metadata::<T>().await?;
            let tuples = self.select_tuples(&space, &conditions).await?;
            Ok::<_, Error>((space, tuples))
        })
        .map_ok(move |(space, tuples)| {
            stream::iter(tuples).map(move |tuple| self.to_entity::<T>(tuple, &space))
        })
        .try_flatten()
    }

    /// Count the entities matching `conditions`.
    pub async fn count<T: Entity>(&self, conditions: &Conditions) -> Result<usize> {
        let space = self.metadata::<T>().await?;
        Ok(self.select_tuples(&space, conditions).await?.len())
    }

    /// Insert a new entity.
    ///
    /// Returns the entity as stored.
    ///
    /// # Errors
    ///
    /// This method fails if an entity with the same primary key already exists.
    pub async fn insert<T: Entity>(&self, entity: T) -> Result<T> {
        let space = self.metadata::<T>().await?;
        let (entity, tuple) = self.prepare_write(entity, &space)?;
        let stored = self
            .client
            .insert(&space.name, tuple)
            .await
            .map_err(Error::translate)?;
        self.saved(entity, stored, &space)
    }

    /// Insert an entity, replacing any existing entity with the same primary key.
    pub async fn replace<T: Entity>(&self, entity: T) -> Result<T> {
        let space = self.metadata::<T>().await?;
        let (entity, tuple) = self.prepare_write(entity, &space)?;
        let stored = self
            .client
            .replace(&space.name, tuple)
            .await
            .map_err(Error::translate)?;
        self.saved(entity, stored, &space)
    }

    /// Update every entity matching `conditions` with the fields of `entity`.
    ///
    /// Only fields which are not `nil` in `entity` are assigned. Primary key fields are never
    /// assigned. Returns the updated entities.
    pub async fn update<T: Entity>(&self, conditions: &Conditions, entity: T) -> Result<Vec<T>> {
        let space = self.metadata::<T>().await?;
        let primary = primary_index(&space)?;
        let (_, tuple) = self.prepare_write(entity, &space)?;
        let mut ops = update_operations(&tuple);
        ops.retain(|op| !primary.parts.contains(&op.field));

        let matched = self.select_tuples(&space, conditions).await?;
        let updated = try_join_all(
            matched
                .iter()
                .map(|tuple| self.client.update(&space.name, primary.key_of(tuple), ops.clone())),
        )
        .await
        .map_err(Error::translate)?;
        updated
            .into_iter()
            .flatten()
            .map(|tuple| self.to_entity(tuple, &space))
            .collect()
    }

    /// Delete an entity, returning it as it was stored.
    pub async fn delete<T: Entity>(&self, entity: &T) -> Result<Option<T>> {
        let key = entity_key(entity)?;
        self.delete_key(key).await
    }

    /// Delete the entity with primary key `id`, returning it if it existed.
    pub async fn delete_by_id<T: Entity>(&self, id: &T::Id) -> Result<Option<T>> {
        let key = key_of::<T>(id)?;
        self.delete_key(key).await
    }

    /// Delete every entity matching `conditions`, returning the deleted entities.
    pub async fn delete_by_conditions<T: Entity>(&self, conditions: &Conditions) -> Result<Vec<T>> {
        let space = self.metadata::<T>().await?;
        let primary = primary_index(&space)?;
        let mut deleted = vec![];
        for tuple in self.select_tuples(&space, conditions).await? {
            deleted.extend(self.delete_tuple::<T>(&space, primary.key_of(&tuple)).await?);
        }
        deleted
            .into_iter()
            .map(|tuple| self.to_entity(tuple, &space))
            .collect()
    }

    /// Delete all entities of type `T`.
    pub async fn truncate<T: Entity>(&self) -> Result<()> {
        self.client
            .truncate(T::space())
            .await
            .map_err(Error::translate)
    }

    /// Call a stored function returning a single value.
    ///
    /// Returns [`None`] if the function returns `nil` or nothing.
    pub async fn call<R: DeserializeOwned>(
        &self,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Option<R>> {
        match self.call_result(function, args).await? {
            None => Ok(None),
            Some(value) => Ok(Some(from_readable(&value)?)),
        }
    }

    /// Call a stored function returning an array of values.
    pub async fn call_for_all<R: DeserializeOwned>(
        &self,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Vec<R>> {
        self.call_results(function, args)
            .await?
            .iter()
            .map(from_readable)
            .collect()
    }

    /// Call a stored function returning a single entity.
    ///
    /// A tuple result is read using the metadata of the entity's space; a map result is read by
    /// field name.
    pub async fn call_for_entity<T: Entity>(
        &self,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Option<T>> {
        let Some(value) = self.call_result(function, args).await? else {
            return Ok(None);
        };
        let space = self.client.space(T::space()).await.map_err(Error::translate)?;
        self.result_to_entity(value, space.as_ref()).map(Some)
    }

    /// Call a stored function returning an array of entities.
    pub async fn call_for_entities<T: Entity>(
        &self,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Vec<T>> {
        let results = self.call_results(function, args).await?;
        let space = self.client.space(T::space()).await.map_err(Error::translate)?;
        results
            .into_iter()
            .map(|value| self.result_to_entity(value, space.as_ref()))
            .collect()
    }

    async fn select_tuples(
        &self,
        space: &SpaceMetadata,
        conditions: &Conditions,
    ) -> Result<Vec<Tuple>> {
        tracing::debug!("select from {}: {conditions}", space.name);
        self.client
            .select(&space.name, conditions)
            .await
            .map_err(Error::translate)
    }

    async fn delete_key<T: Entity>(&self, key: Vec<Value>) -> Result<Option<T>> {
        let space = self.metadata::<T>().await?;
        self.delete_tuple::<T>(&space, key)
            .await?
            .map(|tuple| self.to_entity(tuple, &space))
            .transpose()
    }

    async fn delete_tuple<T: Entity>(
        &self,
        space: &SpaceMetadata,
        key: Vec<Value>,
    ) -> Result<Option<Tuple>> {
        let deleted = self
            .client
            .delete(&space.name, key)
            .await
            .map_err(Error::translate)?
            .into_iter()
            .next();
        if let Some(tuple) = &deleted {
            self.publish(Event::after_delete::<T>(&space.name, tuple));
        }
        Ok(deleted)
    }

    /// The first value returned by `function`, unless it is `nil`.
    async fn call_result(&self, function: &str, args: Vec<Value>) -> Result<Option<Value>> {
        let results = self
            .client
            .call(function, args)
            .await
            .map_err(Error::translate)?;
        Ok(results.into_iter().next().filter(|value| !value.is_nil()))
    }

    /// The elements of the array returned by `function`.
    async fn call_results(&self, function: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        match self.call_result(function, args).await? {
            None => Ok(vec![]),
            Some(Value::Array(values)) => Ok(values),
            Some(value) => Err(Error::mapping(format!(
                "function {function} returned {value}, expected an array"
            ))),
        }
    }

    fn result_to_entity<T: Entity>(&self, value: Value, space: Option<&SpaceMetadata>) -> Result<T> {
        match (value, space) {
            (Value::Array(tuple), Some(space)) => self.to_entity(tuple, space),
            (value, space) => convert::from_result(value, space),
        }
    }

    fn publish(&self, event: Event) {
        for listener in &self.listeners {
            listener.on_event(&event);
        }
    }

    /// Run callbacks and publish events around converting `entity` to a tuple.
    fn prepare_write<T: Entity>(&self, entity: T, space: &SpaceMetadata) -> Result<(T, Tuple)> {
        let entity = self.callbacks.before_convert(entity, &space.name);
        self.publish(Event::before_convert(&space.name, &entity));
        let tuple = convert::to_tuple(&entity, space)?;
        let entity = self.callbacks.before_save(entity, &tuple, &space.name);
        self.publish(Event::before_save(&space.name, &entity, &tuple));
        Ok((entity, tuple))
    }

    fn saved<T: Entity>(&self, entity: T, stored: Vec<Tuple>, space: &SpaceMetadata) -> Result<T> {
        let tuple = stored
            .into_iter()
            .next()
            .ok_or_else(|| Error::translate(C::Error::empty_rows()))?;
        self.publish(Event::after_save(&space.name, &entity, &tuple));
        self.to_entity(tuple, space)
    }

    fn to_entity<T: Entity>(&self, tuple: Tuple, space: &SpaceMetadata) -> Result<T> {
        self.publish(Event::after_load::<T>(&space.name, &tuple));
        let entity = convert::from_tuple(tuple.clone(), space)?;
        self.publish(Event::after_convert(&space.name, &tuple, &entity));
        Ok(entity)
    }
}

fn primary_index(space: &SpaceMetadata) -> Result<&IndexMetadata> {
    space.primary_index().ok_or_else(|| Error::SpaceMetadata {
        message: format!("space {} has no primary index", space.name),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::{mock, FieldMetadata};
    use crate::event::EventKind;
    use crate::Entity;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Entity)]
    #[entity(space = "users")]
    struct User {
        #[entity(id)]
        id: u64,
        name: String,
        email: Option<String>,
    }

    fn user(id: u64, name: &str) -> User {
        User {
            id,
            name: name.into(),
            email: None,
        }
    }

    async fn client() -> mock::Client {
        let client = mock::Client::create();
        client
            .create_space(
                SpaceMetadata::new(
                    0,
                    "users",
                    vec![
                        FieldMetadata::new("id", "unsigned"),
                        FieldMetadata::new("name", "string"),
                        FieldMetadata::nullable("email", "string"),
                    ],
                )
                .with_index(IndexMetadata::new(0, "primary", true, vec![0])),
            )
            .await
            .unwrap();
        client
    }

    #[async_std::test]
    async fn test_crud() {
        let template = Template::new(client().await);

        assert_eq!(template.insert(user(2, "bob")).await.unwrap(), user(2, "bob"));
        template.insert(user(1, "alice")).await.unwrap();
        assert!(matches!(
            template.insert(user(1, "carol")).await,
            Err(Error::DataAccess { .. })
        ));

        assert_eq!(
            template.select_by_id::<User>(&1).await.unwrap(),
            Some(user(1, "alice"))
        );
        assert_eq!(template.select_by_id::<User>(&3).await.unwrap(), None);
        assert_eq!(
            template.select_by_ids::<User>(&[2, 3, 1]).await.unwrap(),
            [user(2, "bob"), user(1, "alice")]
        );
        assert_eq!(
            template.select_all::<User>().await.unwrap(),
            [user(1, "alice"), user(2, "bob")]
        );
        assert_eq!(template.count::<User>(&Conditions::any()).await.unwrap(), 2);

        let carol = template.replace(user(1, "carol")).await.unwrap();
        assert_eq!(carol, user(1, "carol"));
        assert_eq!(
            template.delete(&carol).await.unwrap(),
            Some(user(1, "carol"))
        );
        assert_eq!(template.delete_by_id::<User>(&1).await.unwrap(), None);

        template.truncate::<User>().await.unwrap();
        assert!(template.select_all::<User>().await.unwrap().is_empty());
    }

    #[async_std::test]
    async fn test_conditions() {
        let template = Template::new(client().await);
        for (id, name) in [(1, "alice"), (2, "bob"), (3, "carol"), (4, "dave")] {
            template.insert(user(id, name)).await.unwrap();
        }

        let selected = template
            .select::<User>(&Conditions::any().and_greater_than("id", 1).descending().with_limit(2))
            .await
            .unwrap();
        assert_eq!(selected, [user(4, "dave"), user(3, "carol")]);
        assert_eq!(
            template
                .select_one::<User>(&Conditions::any().and_equals("name", "bob"))
                .await
                .unwrap(),
            Some(user(2, "bob"))
        );

        let updated = template
            .update(
                &Conditions::any().and_less_than("id", 3),
                User {
                    id: 0,
                    name: "same".into(),
                    email: Some("x@example.com".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.len(), 2);
        assert!(updated.iter().all(|u| u.name == "same" && u.id < 3));

        let deleted = template
            .delete_by_conditions::<User>(&Conditions::any().and_equals("name", "same"))
            .await
            .unwrap();
        assert_eq!(deleted.iter().map(|u| u.id).collect::<Vec<_>>(), [1, 2]);

        let streamed = template
            .select_stream::<User>(Conditions::any())
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        assert_eq!(streamed, [user(3, "carol"), user(4, "dave")]);
    }

    #[async_std::test]
    async fn test_missing_space() {
        let template = Template::new(mock::Client::create());
        assert_eq!(
            template.insert(user(1, "alice")).await.unwrap_err(),
            Error::mapping("Space metadata not found for space users")
        );
    }

    #[async_std::test]
    async fn test_events_and_callbacks() {
        let events = Arc::new(Mutex::new(vec![]));
        let listener = {
            let events = events.clone();
            move |event: &Event| events.lock().unwrap().push(event.kind)
        };
        let mut callbacks = Callbacks::new();
        callbacks.on_before_convert::<User>(|mut user: User, _: &str| {
            user.name = user.name.to_uppercase();
            user
        });
        let template = Template::new(client().await)
            .with_listener(listener)
            .with_callbacks(callbacks);

        let saved = template.insert(user(1, "alice")).await.unwrap();
        assert_eq!(saved.name, "ALICE");
        template.delete_by_id::<User>(&1).await.unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            [
                EventKind::BeforeConvert,
                EventKind::BeforeSave,
                EventKind::AfterSave,
                EventKind::AfterLoad,
                EventKind::AfterConvert,
                EventKind::AfterDelete,
                EventKind::AfterLoad,
                EventKind::AfterConvert,
            ]
        );
    }

    #[async_std::test]
    async fn test_functions() {
        let client = client().await;
        client
            .register_function("find_user", |args| {
                let id = args[0].clone();
                Ok(vec![Value::Array(vec![id, Value::from("fn"), Value::Nil])])
            })
            .await;
        client
            .register_function("user_names", |_| {
                Ok(vec![Value::Array(vec![
                    Value::Map(vec![
                        (Value::from("id"), Value::from(7)),
                        (Value::from("name"), Value::from("map")),
                    ]),
                    Value::Array(vec![Value::from(8), Value::from("tuple"), Value::Nil]),
                ])])
            })
            .await;
        client
            .register_function("nothing", |_| Ok(vec![Value::Nil]))
            .await;
        client
            .register_function("answer", |_| Ok(vec![Value::from(42)]))
            .await;
        let template = Template::new(client);

        assert_eq!(
            template
                .call_for_entity::<User>("find_user", vec![Value::from(5)])
                .await
                .unwrap(),
            Some(user(5, "fn"))
        );
        assert_eq!(
            template
                .call_for_entities::<User>("user_names", vec![])
                .await
                .unwrap(),
            [user(7, "map"), user(8, "tuple")]
        );
        assert_eq!(
            template
                .call_for_entity::<User>("nothing", vec![])
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            template.call::<u32>("answer", vec![]).await.unwrap(),
            Some(42)
        );
        assert_eq!(
            template.call_for_all::<u32>("nothing", vec![]).await.unwrap(),
            Vec::<u32>::new()
        );
        assert!(matches!(
            template.call::<u32>("missing", vec![]).await,
            Err(Error::DataRetrieval { .. })
        ));
    }
}
