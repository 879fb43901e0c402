use std::sync::Arc;

use adsboard_auth::{
    auth::{Audience, AuthService, Credentials, LegacySha1Hasher, SessionPolicy, SignUpInput, TokenManager},
    db::{ClientMeta, MemoryStore, SessionStore},
    error::{AppError, AuthError, DatabaseError},
};
use chrono::Duration;

fn service(audience: Audience, store: Arc<MemoryStore>, tokens: Arc<TokenManager>) -> AuthService {
    AuthService::new(
        audience,
        store.clone(),
        store,
        tokens,
        Arc::new(LegacySha1Hasher::new("integration-salt").unwrap()),
        SessionPolicy {
            max_sessions: 3,
            ..SessionPolicy::default()
        },
    )
}

fn user_service() -> (AuthService, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let tokens = Arc::new(TokenManager::new("integration-key").unwrap());
    (service(Audience::User, store.clone(), tokens), store)
}

async fn registered(service: &AuthService) -> String {
    service
        .sign_up(&SignUpInput {
            email: "ann@example.com".into(),
            password: "hunter2".into(),
            first_name: Some("Ann".into()),
            last_name: None,
        })
        .await
        .unwrap()
}

fn credentials() -> Credentials {
    Credentials {
        email: "ann@example.com".into(),
        password: "hunter2".into(),
    }
}

fn assert_session_not_found<T: std::fmt::Debug>(result: Result<T, AppError>) {
    match result {
        Err(AppError::AuthError(AuthError::SessionNotFound)) => (),
        other => panic!("Expected SessionNotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn test_sign_in_and_verify() {
    let (service, _) = user_service();
    let principal = registered(&service).await;

    let tokens = service.sign_in(&credentials(), &ClientMeta::default()).await.unwrap();
    assert_eq!(service.verify_access_token(&tokens.access_token).unwrap(), principal);
}

#[tokio::test]
async fn test_wrong_password() {
    let (service, _) = user_service();
    registered(&service).await;

    let result = service
        .sign_in(
            &Credentials {
                email: "ann@example.com".into(),
                password: "wrong".into(),
            },
            &ClientMeta::default(),
        )
        .await;
    assert!(matches!(result, Err(AppError::AuthError(AuthError::InvalidCredentials))));
}

#[tokio::test]
async fn test_duplicate_sign_up() {
    let (service, _) = user_service();
    registered(&service).await;

    let result = service
        .sign_up(&SignUpInput {
            email: "ann@example.com".into(),
            password: "other".into(),
            first_name: None,
            last_name: None,
        })
        .await;
    assert!(matches!(result, Err(AppError::DatabaseError(DatabaseError::Duplicate))));
}

#[tokio::test]
async fn test_refresh_rotates_and_replay_fails() {
    let (service, _) = user_service();
    let principal = registered(&service).await;
    let meta = ClientMeta::default();

    let first = service.sign_in(&credentials(), &meta).await.unwrap();
    let second = service.refresh_session(&first.refresh_token, &meta).await.unwrap();

    assert_ne!(first.refresh_token, second.refresh_token);
    assert_eq!(service.verify_access_token(&second.access_token).unwrap(), principal);

    // Replays keep failing, however often they are tried.
    for _ in 0..3 {
        assert_session_not_found(service.refresh_session(&first.refresh_token, &meta).await);
    }

    // The rotated token still works exactly once.
    let third = service.refresh_session(&second.refresh_token, &meta).await.unwrap();
    assert_session_not_found(service.refresh_session(&second.refresh_token, &meta).await);
    assert_ne!(third.refresh_token, second.refresh_token);
}

#[tokio::test]
async fn test_expired_session_cannot_refresh() {
    let store = Arc::new(MemoryStore::new());
    let tokens = Arc::new(TokenManager::new("integration-key").unwrap());
    let service = AuthService::new(
        Audience::User,
        store.clone(),
        store.clone(),
        tokens,
        Arc::new(LegacySha1Hasher::new("integration-salt").unwrap()),
        SessionPolicy {
            refresh_ttl: Duration::seconds(-1),
            ..SessionPolicy::default()
        },
    );

    let issued = service.create_session("p-1", &ClientMeta::default()).await.unwrap();
    assert_session_not_found(service.refresh_session(&issued.refresh_token, &ClientMeta::default()).await);
    assert_eq!(service.purge_expired_sessions().await.unwrap(), 1);
}

#[tokio::test]
async fn test_session_cap_revokes_all() {
    let (service, store) = user_service();
    let meta = ClientMeta::default();

    let mut issued = Vec::new();
    for _ in 0..3 {
        issued.push(service.create_session("p-1", &meta).await.unwrap());
    }
    assert_eq!(store.count_sessions_by_principal("p-1").await.unwrap(), 3);

    let latest = service.create_session("p-1", &meta).await.unwrap();
    assert_eq!(store.count_sessions_by_principal("p-1").await.unwrap(), 1);

    for old in issued {
        assert_session_not_found(service.refresh_session(&old.refresh_token, &meta).await);
    }
    assert!(service.refresh_session(&latest.refresh_token, &meta).await.is_ok());
}

#[tokio::test]
async fn test_refresh_revokes_sibling_sessions() {
    let (service, store) = user_service();
    let meta = ClientMeta::default();

    let a = service.create_session("p-1", &meta).await.unwrap();
    let b = service.create_session("p-1", &meta).await.unwrap();
    service.create_session("p-2", &meta).await.unwrap();

    service.refresh_session(&a.refresh_token, &meta).await.unwrap();
    assert_eq!(store.count_sessions_by_principal("p-1").await.unwrap(), 1);
    assert_eq!(store.count_sessions_by_principal("p-2").await.unwrap(), 1);
    assert_session_not_found(service.refresh_session(&b.refresh_token, &meta).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_refresh_single_winner() {
    let (service, store) = user_service();
    let service = Arc::new(service);
    let issued = service.create_session("p-1", &ClientMeta::default()).await.unwrap();

    let attempts = (0..16).map(|_| {
        let service = service.clone();
        let token = issued.refresh_token.clone();
        tokio::spawn(async move { service.refresh_session(&token, &ClientMeta::default()).await })
    });
    let results: Vec<_> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked"))
        .collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    for result in results.into_iter().filter(|r| r.is_err()) {
        assert_session_not_found(result);
    }
    assert_eq!(store.count_sessions_by_principal("p-1").await.unwrap(), 1);
}

#[tokio::test]
async fn test_sign_out_is_idempotent() {
    let (service, store) = user_service();
    let meta = ClientMeta::default();
    let issued = service.create_session("p-1", &meta).await.unwrap();
    service.create_session("p-1", &meta).await.unwrap();

    assert_eq!(service.sign_out("p-1").await.unwrap(), 2);
    assert_eq!(service.sign_out("p-1").await.unwrap(), 0);
    assert_eq!(store.session_count().await, 0);
    assert_session_not_found(service.refresh_session(&issued.refresh_token, &meta).await);
}

#[tokio::test]
async fn test_audiences_are_isolated() {
    let tokens = Arc::new(TokenManager::new("shared-key").unwrap());
    let users = service(Audience::User, Arc::new(MemoryStore::new()), tokens.clone());
    let admins = service(Audience::Admin, Arc::new(MemoryStore::new()), tokens);
    let meta = ClientMeta::default();

    let user_tokens = users.create_session("same-id", &meta).await.unwrap();
    let admin_tokens = admins.create_session("same-id", &meta).await.unwrap();

    assert!(admins.verify_access_token(&user_tokens.access_token).is_err());
    assert!(users.verify_access_token(&admin_tokens.access_token).is_err());
    assert_session_not_found(admins.refresh_session(&user_tokens.refresh_token, &meta).await);
    assert!(users.refresh_session(&user_tokens.refresh_token, &meta).await.is_ok());
}
