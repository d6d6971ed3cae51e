//! Repositories of entities.
//!
//! A [`Repository`] is the collection-like view of the entities of one type: it saves, finds and
//! deletes entities by id, and runs [queries derived from method names](derived).
//!
//! ```
//! # use serde::{Deserialize, Serialize};
//! # use tarantool_data::{client::Client, Entity, Repository, Template, Value};
//! # #[derive(Clone, Debug, Serialize, Deserialize, Entity)]
//! # struct User { #[entity(id)] id: u64, name: String, age: u32 }
//! # async fn example(client: impl Client) -> tarantool_data::error::Result<()> {
//! let users = Repository::<User, _>::new(Template::new(client));
//! let adults = users
//!     .find_by("findByAgeGreaterThanEqual", vec![Value::from(18)])
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::client::Client;
use crate::error::{Error, Result};
use crate::mapping::Entity;
use crate::query::{Conditions, Sort};
use crate::template::Template;
use derivative::Derivative;
use futures::future::try_join_all;
use rmpv::Value;
use std::marker::PhantomData;

pub mod derived;

pub use derived::{DerivedQuery, Execution};

/// The result of running a [`DerivedQuery`].
#[derive(Clone, Debug, PartialEq)]
pub enum QueryResult<T> {
    Count(usize),
    Exists(bool),
    Deleted(Vec<T>),
    Collection(Vec<T>),
    Single(Option<T>),
}

impl<T> QueryResult<T> {
    /// The entities returned or deleted by the query.
    pub fn into_entities(self) -> Vec<T> {
        match self {
            Self::Deleted(entities) | Self::Collection(entities) => entities,
            Self::Single(entity) => entity.into_iter().collect(),
            Self::Count(_) | Self::Exists(_) => vec![],
        }
    }

    /// The number of entities matched by the query.
    pub fn count(&self) -> usize {
        match self {
            Self::Count(n) => *n,
            Self::Exists(exists) => *exists as usize,
            Self::Deleted(entities) | Self::Collection(entities) => entities.len(),
            Self::Single(entity) => entity.is_some() as usize,
        }
    }
}

/// The entities of type `T`.
#[derive(Derivative)]
#[derivative(Clone(bound = "C: Clone"), Debug(bound = "C: std::fmt::Debug"))]
pub struct Repository<T, C> {
    template: Template<C>,
    #[derivative(Debug = "ignore")]
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity, C: Client> Repository<T, C> {
    pub fn new(template: Template<C>) -> Self {
        Self {
            template,
            _entity: PhantomData,
        }
    }

    pub fn template(&self) -> &Template<C> {
        &self.template
    }

    /// Insert `entity` if it is new, otherwise replace the stored entity with the same id.
    pub async fn save(&self, entity: T) -> Result<T> {
        if entity.is_new() {
            self.template.insert(entity).await
        } else {
            self.template.replace(entity).await
        }
    }

    /// Save each of `entities` in turn.
    pub async fn save_all(&self, entities: impl IntoIterator<Item = T>) -> Result<Vec<T>> {
        let mut saved = vec![];
        for entity in entities {
            saved.push(self.save(entity).await?);
        }
        Ok(saved)
    }

    pub async fn find_by_id(&self, id: &T::Id) -> Result<Option<T>> {
        self.template.select_by_id(id).await
    }

    pub async fn exists_by_id(&self, id: &T::Id) -> Result<bool> {
        Ok(self.find_by_id(id).await?.is_some())
    }

    pub async fn find_all(&self) -> Result<Vec<T>> {
        self.template.select_all().await
    }

    /// All entities, ordered by primary key.
    pub async fn find_all_sorted(&self, sort: Sort) -> Result<Vec<T>> {
        self.template.select(&sort.apply(Conditions::any())).await
    }

    /// The entities with the given ids. Ids which do not exist are skipped.
    pub async fn find_all_by_id(&self, ids: &[T::Id]) -> Result<Vec<T>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        self.template.select_by_ids(ids).await
    }

    /// The entities matching `conditions`.
    pub async fn find(&self, conditions: &Conditions) -> Result<Vec<T>> {
        self.template.select(conditions).await
    }

    pub async fn count(&self) -> Result<usize> {
        self.template.count::<T>(&Conditions::any()).await
    }

    pub async fn delete_by_id(&self, id: &T::Id) -> Result<()> {
        self.template.delete_by_id::<T>(id).await?;
        Ok(())
    }

    pub async fn delete(&self, entity: &T) -> Result<()> {
        self.template.delete(entity).await?;
        Ok(())
    }

    pub async fn delete_all_by_id(&self, ids: &[T::Id]) -> Result<()> {
        try_join_all(ids.iter().map(|id| self.delete_by_id(id))).await?;
        Ok(())
    }

    pub async fn delete_all_of(&self, entities: &[T]) -> Result<()> {
        for entity in entities {
            self.delete(entity).await?;
        }
        Ok(())
    }

    /// Delete every entity of type `T`.
    pub async fn delete_all(&self) -> Result<()> {
        self.template.truncate::<T>().await
    }

    /// Parse a query from a method name.
    pub fn query(&self, method: &str) -> Result<DerivedQuery> {
        DerivedQuery::for_entity::<T>(method)
    }

    /// Run a derived query with the given parameters.
    pub async fn execute(&self, query: &DerivedQuery, params: Vec<Value>) -> Result<QueryResult<T>> {
        let conditions = query.bind(params)?.into_conditions();
        tracing::debug!("{}: {conditions}", query.method());
        Ok(match query.execution() {
            Execution::Count => QueryResult::Count(self.template.count::<T>(&conditions).await?),
            Execution::Exists => {
                QueryResult::Exists(self.template.select_one::<T>(&conditions).await?.is_some())
            }
            Execution::Delete => {
                QueryResult::Deleted(self.template.delete_by_conditions(&conditions).await?)
            }
            Execution::Collection => QueryResult::Collection(self.template.select(&conditions).await?),
            Execution::Single => QueryResult::Single(self.template.select_one(&conditions).await?),
        })
    }

    /// Run the query named by `method`, returning the matching entities.
    pub async fn find_by(&self, method: &str, params: Vec<Value>) -> Result<Vec<T>> {
        let query = self.query(method)?;
        Ok(self.execute(&query, params).await?.into_entities())
    }

    /// Run the query named by `method`, returning the first matching entity.
    pub async fn find_one_by(&self, method: &str, params: Vec<Value>) -> Result<Option<T>> {
        let query = self.query(method)?.single();
        Ok(self.execute(&query, params).await?.into_entities().into_iter().next())
    }

    /// Run a query implemented by the stored function `function`.
    ///
    /// The function receives `params` and returns an array of tuples or maps.
    pub async fn function_query(&self, function: &str, params: Vec<Value>) -> Result<Vec<T>> {
        if function.is_empty() {
            return Err(Error::invalid_usage("function name must not be empty"));
        }
        self.template.call_for_entities(function, params).await
    }

    /// Run a query implemented by the stored function `function`, which returns a single tuple or
    /// map.
    pub async fn function_query_one(&self, function: &str, params: Vec<Value>) -> Result<Option<T>> {
        if function.is_empty() {
            return Err(Error::invalid_usage("function name must not be empty"));
        }
        self.template.call_for_entity(function, params).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::{mock, FieldMetadata, IndexMetadata, SpaceMetadata};
    use crate::{Entity, MapId};
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Entity)]
    #[serde(rename_all = "camelCase")]
    struct Book {
        #[entity(id)]
        id: Option<u64>,
        title: String,
        publish_year: u32,
        in_print: bool,
    }

    fn book(id: u64, title: &str, publish_year: u32, in_print: bool) -> Book {
        Book {
            id: Some(id),
            title: title.into(),
            publish_year,
            in_print,
        }
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Entity)]
    #[entity(space = "ratings")]
    struct Rating {
        #[entity(id, key = "user, book")]
        #[serde(flatten)]
        key: MapId,
        stars: u8,
    }

    async fn repository<T: Entity>(client: &mock::Client) -> Repository<T, mock::Client> {
        Repository::new(Template::new(client.clone()))
    }

    async fn client() -> mock::Client {
        let client = mock::Client::create();
        client
            .create_space(
                SpaceMetadata::new(
                    0,
                    "book",
                    vec![
                        FieldMetadata::new("id", "unsigned"),
                        FieldMetadata::new("title", "string"),
                        FieldMetadata::new("publishYear", "unsigned"),
                        FieldMetadata::new("inPrint", "boolean"),
                    ],
                )
                .with_index(IndexMetadata::new(0, "primary", true, vec![0])),
            )
            .await
            .unwrap();
        client
            .create_space(
                SpaceMetadata::new(
                    0,
                    "ratings",
                    vec![
                        FieldMetadata::new("user", "string"),
                        FieldMetadata::new("book", "unsigned"),
                        FieldMetadata::new("stars", "unsigned"),
                    ],
                )
                .with_index(IndexMetadata::new(0, "primary", true, vec![0, 1])),
            )
            .await
            .unwrap();
        client
    }

    async fn books(client: &mock::Client) -> Repository<Book, mock::Client> {
        let books = repository::<Book>(client).await;
        books
            .save_all([
                book(1, "Dune", 1965, true),
                book(2, "Emma", 1815, true),
                book(3, "Ubik", 1969, false),
                book(4, "Solaris", 1961, true),
            ])
            .await
            .unwrap();
        books
    }

    #[async_std::test]
    async fn test_crud() {
        let client = client().await;
        let books = books(&client).await;

        assert_eq!(books.count().await.unwrap(), 4);
        assert!(books.exists_by_id(&Some(2)).await.unwrap());
        assert!(!books.exists_by_id(&Some(9)).await.unwrap());
        assert_eq!(
            books.find_by_id(&Some(3)).await.unwrap(),
            Some(book(3, "Ubik", 1969, false))
        );
        assert!(books.find_all_by_id(&[]).await.unwrap().is_empty());
        assert_eq!(
            books
                .find_all_by_id(&[Some(4), Some(1)])
                .await
                .unwrap()
                .into_iter()
                .map(|b| b.title)
                .collect::<Vec<_>>(),
            ["Solaris", "Dune"]
        );
        assert_eq!(
            books
                .find_all_sorted(Sort::Desc)
                .await
                .unwrap()
                .iter()
                .map(|b| b.id)
                .collect::<Vec<_>>(),
            [Some(4), Some(3), Some(2), Some(1)]
        );

        // Saving an existing entity replaces it.
        books.save(book(2, "Emma (revised)", 1816, false)).await.unwrap();
        assert_eq!(
            books.find_by_id(&Some(2)).await.unwrap().unwrap().title,
            "Emma (revised)"
        );

        books.delete_by_id(&Some(1)).await.unwrap();
        books.delete(&book(2, "", 0, false)).await.unwrap();
        assert_eq!(books.count().await.unwrap(), 2);
        books.delete_all_by_id(&[Some(3), Some(9)]).await.unwrap();
        books
            .delete_all_of(&[book(4, "Solaris", 1961, true)])
            .await
            .unwrap();
        assert_eq!(books.count().await.unwrap(), 0);

        books.save(book(5, "Kindred", 1979, true)).await.unwrap();
        books.delete_all().await.unwrap();
        assert!(books.find_all().await.unwrap().is_empty());
    }

    #[async_std::test]
    async fn test_new_entity_without_id() {
        let client = client().await;
        let books = repository::<Book>(&client).await;
        let err = books
            .save(Book {
                id: None,
                title: "Untitled".into(),
                publish_year: 2000,
                in_print: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DataAccess { .. }));
    }

    #[async_std::test]
    async fn test_derived_queries() {
        let client = client().await;
        let books = books(&client).await;

        let titles = |books: Vec<Book>| books.into_iter().map(|b| b.title).collect::<Vec<_>>();
        assert_eq!(
            titles(
                books
                    .find_by("findByPublishYearBetween", vec![1960.into(), 1966.into()])
                    .await
                    .unwrap()
            ),
            ["Dune", "Solaris"]
        );
        assert_eq!(
            titles(
                books
                    .find_by("findTop2ByInPrintIsTrue", vec![])
                    .await
                    .unwrap()
            ),
            ["Dune", "Emma"]
        );
        assert_eq!(
            books
                .find_one_by("findByTitle", vec!["Ubik".into()])
                .await
                .unwrap()
                .and_then(|b| b.id),
            Some(3)
        );

        let query = books.query("countByPublishYearBefore").unwrap();
        assert_eq!(
            books.execute(&query, vec![1962.into()]).await.unwrap(),
            QueryResult::Count(2)
        );
        let query = books.query("existsByTitleAndInPrintFalse").unwrap();
        assert_eq!(
            books.execute(&query, vec!["Dune".into()]).await.unwrap(),
            QueryResult::Exists(false)
        );

        let deleted = books
            .find_by("deleteByInPrintFalse", vec![])
            .await
            .unwrap();
        assert_eq!(titles(deleted), ["Ubik"]);
        assert_eq!(books.count().await.unwrap(), 3);

        assert!(matches!(
            books.find_by("findByTitleOrPublishYear", vec![]).await,
            Err(Error::InvalidApiUsage { .. })
        ));
    }

    #[async_std::test]
    async fn test_map_id() {
        let client = client().await;
        let ratings = repository::<Rating>(&client).await;
        let id = MapId::new().with("user", "ann").with("book", 1);
        ratings
            .save(Rating {
                key: id.clone(),
                stars: 5,
            })
            .await
            .unwrap();
        assert_eq!(
            ratings.find_by_id(&id).await.unwrap().map(|r| r.stars),
            Some(5)
        );
        ratings
            .save(Rating {
                key: id.clone(),
                stars: 3,
            })
            .await
            .unwrap();
        assert_eq!(ratings.count().await.unwrap(), 1);
        assert_eq!(
            ratings
                .find_by("findByStarsLessThan", vec![4.into()])
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[async_std::test]
    async fn test_function_query() {
        let client = client().await;
        client
            .register_function("classics", |args| {
                let year = args[0].clone();
                Ok(vec![Value::Array(vec![Value::Array(vec![
                    Value::from(9),
                    Value::from("Beowulf"),
                    year,
                    Value::from(false),
                ])])])
            })
            .await;
        let books = repository::<Book>(&client).await;
        assert_eq!(
            books
                .function_query("classics", vec![Value::from(1000)])
                .await
                .unwrap(),
            [book(9, "Beowulf", 1000, false)]
        );
        assert!(matches!(
            books.function_query("", vec![]).await,
            Err(Error::InvalidApiUsage { .. })
        ));
    }
}
