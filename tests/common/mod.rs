//! A small GraphQL façade over an in-memory store: users, their profiles and
//! posts, member types, and subscriptions between users. Every relation
//! field resolves through a batch coordinator, and the store logs each bulk
//! fetch so tests can count them.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use async_graphql::{
    ComplexObject, Context, EmptyMutation, EmptySubscription, Object, Request, Response, Schema,
    SimpleObject,
};
use fieldloader::{load, BatchCoordinator, BatchRules, Registry};
use futures::future::{self, Ready};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("store unavailable")]
pub struct StoreError;

type Fetched<T> = Ready<Result<Vec<T>, StoreError>>;

#[derive(Debug, Clone, SimpleObject)]
#[graphql(complex)]
pub struct User {
    pub id: String,
    pub name: String,
    pub balance: f64,
}

#[derive(Debug, Clone, SimpleObject)]
#[graphql(complex)]
pub struct Profile {
    pub id: String,
    pub is_male: bool,
    pub year_of_birth: i32,
    #[graphql(skip)]
    pub user_id: String,
    #[graphql(skip)]
    pub member_type_id: String,
}

#[derive(Debug, Clone, SimpleObject)]
#[graphql(complex)]
pub struct Post {
    pub id: String,
    pub title: String,
    pub content: String,
    #[graphql(skip)]
    pub author_id: String,
}

#[derive(Debug, Clone, SimpleObject)]
#[graphql(complex)]
pub struct MemberType {
    pub id: String,
    pub discount: f64,
    pub posts_limit_per_month: i32,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub subscriber_id: String,
    pub author_id: String,
}

/// The user on the far side of a subscription, tagged with the user on the
/// near side so it can be matched back to its parent.
#[derive(Debug, Clone)]
struct Subscribed {
    key: String,
    user: User,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fetch {
    pub relation: &'static str,
    pub keys: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Store {
    pub users: Vec<User>,
    pub profiles: Vec<Profile>,
    pub posts: Vec<Post>,
    pub member_types: Vec<MemberType>,
    pub subscriptions: Vec<Subscription>,
    failing: AtomicBool,
    fetches: Mutex<Vec<Fetch>>,
}

fn user(id: &str, name: &str) -> User {
    User {
        id: id.into(),
        name: name.into(),
        balance: 100.0,
    }
}

fn profile(id: &str, user_id: &str, member_type_id: &str) -> Profile {
    Profile {
        id: id.into(),
        is_male: true,
        year_of_birth: 1990,
        user_id: user_id.into(),
        member_type_id: member_type_id.into(),
    }
}

fn post(id: &str, author_id: &str) -> Post {
    Post {
        id: id.into(),
        title: format!("title of {}", id),
        content: format!("content of {}", id),
        author_id: author_id.into(),
    }
}

fn subscription(subscriber_id: &str, author_id: &str) -> Subscription {
    Subscription {
        subscriber_id: subscriber_id.into(),
        author_id: author_id.into(),
    }
}

impl Store {
    /// Three users. u1 and u2 have profiles, u3 doesn't; u1 wrote three
    /// posts and u3 one; u1 follows u2 and u3, u2 follows u3.
    pub fn seeded() -> Self {
        Store {
            users: vec![user("u1", "ann"), user("u2", "bob"), user("u3", "cat")],
            profiles: vec![profile("p1", "u1", "basic"), profile("p2", "u2", "business")],
            posts: vec![
                post("t1", "u1"),
                post("t2", "u1"),
                post("t3", "u1"),
                post("t4", "u3"),
            ],
            member_types: vec![
                MemberType {
                    id: "basic".into(),
                    discount: 0.0,
                    posts_limit_per_month: 10,
                },
                MemberType {
                    id: "business".into(),
                    discount: 5.0,
                    posts_limit_per_month: 100,
                },
            ],
            subscriptions: vec![
                subscription("u1", "u2"),
                subscription("u1", "u3"),
                subscription("u2", "u3"),
            ],
            ..Store::default()
        }
    }

    /// Make every bulk fetch from now on fail.
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> Vec<Fetch> {
        self.fetches.lock().unwrap().clone()
    }

    /// The keys of every fetch of one relation, in order.
    pub fn fetches_of(&self, relation: &str) -> Vec<Vec<String>> {
        self.fetches()
            .into_iter()
            .filter(|fetch| fetch.relation == relation)
            .map(|fetch| fetch.keys)
            .collect()
    }

    fn fetch<T: Clone>(
        &self,
        relation: &'static str,
        keys: Vec<String>,
        rows: impl Iterator<Item = T>,
    ) -> Fetched<T> {
        let result = match self.failing.load(Ordering::SeqCst) {
            true => Err(StoreError),
            false => Ok(rows.collect()),
        };

        self.fetches.lock().unwrap().push(Fetch { relation, keys });
        future::ready(result)
    }

    fn user_by_id(&self, id: &str) -> Option<&User> {
        self.users.iter().find(|user| user.id == id)
    }

    fn users_by_id(&self, ids: Vec<String>) -> Fetched<User> {
        let rows = self.users.iter().filter(|user| ids.contains(&user.id)).cloned();
        self.fetch("users_by_id", ids.clone(), rows)
    }

    fn profiles_by_user(&self, user_ids: Vec<String>) -> Fetched<Profile> {
        let rows = self
            .profiles
            .iter()
            .filter(|profile| user_ids.contains(&profile.user_id))
            .cloned();
        self.fetch("profiles_by_user", user_ids.clone(), rows)
    }

    fn profiles_by_member_type(&self, member_type_ids: Vec<String>) -> Fetched<Profile> {
        let rows = self
            .profiles
            .iter()
            .filter(|profile| member_type_ids.contains(&profile.member_type_id))
            .cloned();
        self.fetch("profiles_by_member_type", member_type_ids.clone(), rows)
    }

    fn posts_by_author(&self, author_ids: Vec<String>) -> Fetched<Post> {
        let rows = self
            .posts
            .iter()
            .filter(|post| author_ids.contains(&post.author_id))
            .cloned();
        self.fetch("posts_by_author", author_ids.clone(), rows)
    }

    fn member_types_by_id(&self, ids: Vec<String>) -> Fetched<MemberType> {
        let rows = self
            .member_types
            .iter()
            .filter(|member_type| ids.contains(&member_type.id))
            .cloned();
        self.fetch("member_types_by_id", ids.clone(), rows)
    }

    /// The authors each subscriber follows.
    fn subscribed_to_by_subscriber(&self, subscriber_ids: Vec<String>) -> Fetched<Subscribed> {
        let rows = self
            .subscriptions
            .iter()
            .filter(|sub| subscriber_ids.contains(&sub.subscriber_id))
            .filter_map(|sub| {
                Some(Subscribed {
                    key: sub.subscriber_id.clone(),
                    user: self.user_by_id(&sub.author_id)?.clone(),
                })
            });
        self.fetch("subscribed_to_by_subscriber", subscriber_ids.clone(), rows)
    }

    /// The subscribers of each author.
    fn subscribers_by_author(&self, author_ids: Vec<String>) -> Fetched<Subscribed> {
        let rows = self
            .subscriptions
            .iter()
            .filter(|sub| author_ids.contains(&sub.author_id))
            .filter_map(|sub| {
                Some(Subscribed {
                    key: sub.author_id.clone(),
                    user: self.user_by_id(&sub.subscriber_id)?.clone(),
                })
            });
        self.fetch("subscribers_by_author", author_ids.clone(), rows)
    }
}

fn store(ctx: &Context<'_>) -> async_graphql::Result<Arc<Store>> {
    Ok(Arc::clone(ctx.data::<Arc<Store>>()?))
}

#[ComplexObject]
impl User {
    async fn profile(&self, ctx: &Context<'_>) -> async_graphql::Result<Option<Profile>> {
        let store = store(ctx)?;
        let profile = load(ctx, self.id.clone(), move || {
            BatchCoordinator::singular(
                BatchRules::default(),
                move |user_ids: Vec<String>| store.profiles_by_user(user_ids),
                |profile: &Profile| profile.user_id.clone(),
            )
        })
        .await?;

        Ok(profile)
    }

    async fn posts(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<Post>> {
        let store = store(ctx)?;
        let posts = load(ctx, self.id.clone(), move || {
            BatchCoordinator::plural(
                BatchRules::default(),
                move |author_ids: Vec<String>| store.posts_by_author(author_ids),
                |post: &Post| post.author_id.clone(),
            )
        })
        .await?;

        Ok(posts)
    }

    async fn user_subscribed_to(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<User>> {
        let store = store(ctx)?;
        let subscribed = load(ctx, self.id.clone(), move || {
            BatchCoordinator::plural(
                BatchRules::default(),
                move |subscriber_ids: Vec<String>| store.subscribed_to_by_subscriber(subscriber_ids),
                |subscribed: &Subscribed| subscribed.key.clone(),
            )
        })
        .await?;

        Ok(subscribed.into_iter().map(|subscribed| subscribed.user).collect())
    }

    async fn subscribed_to_user(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<User>> {
        let store = store(ctx)?;
        let subscribers = load(ctx, self.id.clone(), move || {
            BatchCoordinator::plural(
                BatchRules::default(),
                move |author_ids: Vec<String>| store.subscribers_by_author(author_ids),
                |subscribed: &Subscribed| subscribed.key.clone(),
            )
        })
        .await?;

        Ok(subscribers.into_iter().map(|subscribed| subscribed.user).collect())
    }
}

#[ComplexObject]
impl Profile {
    async fn user(&self, ctx: &Context<'_>) -> async_graphql::Result<Option<User>> {
        let store = store(ctx)?;
        let user = load(ctx, self.user_id.clone(), move || {
            BatchCoordinator::singular(
                BatchRules::default(),
                move |ids: Vec<String>| store.users_by_id(ids),
                |user: &User| user.id.clone(),
            )
        })
        .await?;

        Ok(user)
    }

    async fn member_type(&self, ctx: &Context<'_>) -> async_graphql::Result<Option<MemberType>> {
        let store = store(ctx)?;
        let member_type = load(ctx, self.member_type_id.clone(), move || {
            BatchCoordinator::singular(
                BatchRules::default(),
                move |ids: Vec<String>| store.member_types_by_id(ids),
                |member_type: &MemberType| member_type.id.clone(),
            )
        })
        .await?;

        Ok(member_type)
    }
}

#[ComplexObject]
impl Post {
    async fn author(&self, ctx: &Context<'_>) -> async_graphql::Result<Option<User>> {
        let store = store(ctx)?;
        let author = load(ctx, self.author_id.clone(), move || {
            BatchCoordinator::singular(
                BatchRules::default(),
                move |ids: Vec<String>| store.users_by_id(ids),
                |user: &User| user.id.clone(),
            )
        })
        .await?;

        Ok(author)
    }
}

#[ComplexObject]
impl MemberType {
    async fn profiles(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<Profile>> {
        let store = store(ctx)?;
        let profiles = load(ctx, self.id.clone(), move || {
            BatchCoordinator::plural(
                BatchRules::default(),
                move |member_type_ids: Vec<String>| store.profiles_by_member_type(member_type_ids),
                |profile: &Profile| profile.member_type_id.clone(),
            )
        })
        .await?;

        Ok(profiles)
    }
}

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    async fn users(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<User>> {
        Ok(store(ctx)?.users.clone())
    }

    async fn user(&self, ctx: &Context<'_>, id: String) -> async_graphql::Result<Option<User>> {
        Ok(store(ctx)?.user_by_id(&id).cloned())
    }

    async fn profiles(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<Profile>> {
        Ok(store(ctx)?.profiles.clone())
    }

    async fn posts(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<Post>> {
        Ok(store(ctx)?.posts.clone())
    }

    async fn member_types(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<MemberType>> {
        Ok(store(ctx)?.member_types.clone())
    }
}

pub type FacadeSchema = Schema<QueryRoot, EmptyMutation, EmptySubscription>;

pub fn schema(store: Arc<Store>) -> FacadeSchema {
    Schema::build(QueryRoot, EmptyMutation, EmptySubscription)
        .data(store)
        .finish()
}

/// Execute a query the way a server would: with a fresh registry for the
/// request.
pub async fn execute(schema: &FacadeSchema, query: &str) -> Response {
    schema
        .execute(Request::new(query).data(Registry::new()))
        .await
}
