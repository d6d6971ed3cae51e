//! A synchronous [`Template`].
//!
//! Each operation blocks the calling thread until the asynchronous operation completes. Do not use
//! this from within an asynchronous task.

use crate::client::{Client, SpaceMetadata};
use crate::error::Result;
use crate::event::{Callbacks, EventListener};
use crate::mapping::Entity;
use crate::query::Conditions;
use async_std::task::block_on;
use futures::executor::block_on_stream;
use rmpv::Value;
use serde::de::DeserializeOwned;

/// Blocking entity operations over a client.
#[derive(Clone, Debug)]
pub struct Template<C>(super::Template<C>);

impl<C: Client> From<super::Template<C>> for Template<C> {
    fn from(template: super::Template<C>) -> Self {
        Self(template)
    }
}

impl<C: Client> Template<C> {
    pub fn new(client: C) -> Self {
        Self(super::Template::new(client))
    }

    pub fn with_listener(self, listener: impl EventListener + 'static) -> Self {
        Self(self.0.with_listener(listener))
    }

    pub fn with_callbacks(self, callbacks: Callbacks) -> Self {
        Self(self.0.with_callbacks(callbacks))
    }

    /// The asynchronous template wrapped by this one.
    pub fn inner(&self) -> &super::Template<C> {
        &self.0
    }

    pub fn client(&self) -> &C {
        self.0.client()
    }

    pub fn is_proxy(&self) -> bool {
        self.0.is_proxy()
    }

    pub fn metadata<T: Entity>(&self) -> Result<SpaceMetadata> {
        block_on(self.0.metadata::<T>())
    }

    pub fn select_by_id<T: Entity>(&self, id: &T::Id) -> Result<Option<T>> {
        block_on(self.0.select_by_id(id))
    }

    pub fn select_by_ids<T: Entity>(&self, ids: &[T::Id]) -> Result<Vec<T>> {
        block_on(self.0.select_by_ids(ids))
    }

    pub fn select_one<T: Entity>(&self, conditions: &Conditions) -> Result<Option<T>> {
        block_on(self.0.select_one(conditions))
    }

    pub fn select<T: Entity>(&self, conditions: &Conditions) -> Result<Vec<T>> {
        block_on(self.0.select(conditions))
    }

    pub fn select_all<T: Entity>(&self) -> Result<Vec<T>> {
        block_on(self.0.select_all())
    }

    /// Iterate over the entities matching `conditions`.
    pub fn select_iter<T: Entity>(
        &self,
        conditions: Conditions,
    ) -> impl Iterator<Item = Result<T>> + '_ {
        block_on_stream(Box::pin(self.0.select_stream(conditions)))
    }

    pub fn count<T: Entity>(&self, conditions: &Conditions) -> Result<usize> {
        block_on(self.0.count::<T>(conditions))
    }

    pub fn insert<T: Entity>(&self, entity: T) -> Result<T> {
        block_on(self.0.insert(entity))
    }

    pub fn replace<T: Entity>(&self, entity: T) -> Result<T> {
        block_on(self.0.replace(entity))
    }

    pub fn update<T: Entity>(&self, conditions: &Conditions, entity: T) -> Result<Vec<T>> {
        block_on(self.0.update(conditions, entity))
    }

    pub fn delete<T: Entity>(&self, entity: &T) -> Result<Option<T>> {
        block_on(self.0.delete(entity))
    }

    pub fn delete_by_id<T: Entity>(&self, id: &T::Id) -> Result<Option<T>> {
        block_on(self.0.delete_by_id(id))
    }

    pub fn delete_by_conditions<T: Entity>(&self, conditions: &Conditions) -> Result<Vec<T>> {
        block_on(self.0.delete_by_conditions(conditions))
    }

    pub fn truncate<T: Entity>(&self) -> Result<()> {
        block_on(self.0.truncate::<T>())
    }

    pub fn call<R: DeserializeOwned>(&self, function: &str, args: Vec<Value>) -> Result<Option<R>> {
        block_on(self.0.call(function, args))
    }

    pub fn call_for_all<R: DeserializeOwned>(
        &self,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Vec<R>> {
        block_on(self.0.call_for_all(function, args))
    }

    pub fn call_for_entity<T: Entity>(&self, function: &str, args: Vec<Value>) -> Result<Option<T>> {
        block_on(self.0.call_for_entity(function, args))
    }

    pub fn call_for_entities<T: Entity>(&self, function: &str, args: Vec<Value>) -> Result<Vec<T>> {
        block_on(self.0.call_for_entities(function, args))
    }
}
