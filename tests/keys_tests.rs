//! 签名密钥生命周期与令牌集成测试

use chrono::Duration;
use iam_core::{
    crypto::resolve_signing_key,
    error::AppError,
    jwks::{RotationSchedule, RotationScheduler},
    models::key::{JwksSnapshot, Jwks, KeyStatus, RotationPolicy, SigningAlgorithm},
    token::TokenSubject,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod common;
use common::{test_policy, TestStack};

fn subject() -> TokenSubject {
    TokenSubject::new("u1", "acct-1").with_tenant("t1")
}

async fn published(stack: &TestStack) -> Jwks {
    match stack.key_manager.build_jwks(None).await.unwrap() {
        JwksSnapshot::Changed(p) => serde_json::from_slice(&p.body).unwrap(),
        JwksSnapshot::Unchanged(_) => panic!("expected a fresh JWKS body"),
    }
}

#[tokio::test]
async fn test_rotation_preserves_existing_tokens() {
    let stack = TestStack::new().await;
    let k1 = stack.key_manager.ensure_active_key().await.unwrap().kid;

    let t1 = stack
        .tokens
        .issue_access(&subject(), Some(Duration::days(60)))
        .await
        .unwrap();
    assert_eq!(t1.kid, k1);

    let outcome = stack.key_manager.rotate_key().await.unwrap();
    assert_eq!(outcome.demoted, vec![k1.clone()]);
    assert_ne!(outcome.new_kid, k1);

    let claims = stack.tokens.verify(&t1.token).await.unwrap();
    assert_eq!(claims.user_id, "u1");
    assert_eq!(claims.tenant_id.as_deref(), Some("t1"));

    // 宽限期结束后再次轮换，K1 退役
    stack.clock.advance(Duration::days(7) + Duration::seconds(1));
    let outcome = stack.key_manager.rotate_key().await.unwrap();
    assert!(outcome.retired.contains(&k1));
    assert_eq!(
        stack.key_manager.get_key(&k1).await.unwrap().unwrap().status,
        KeyStatus::Retired
    );

    assert!(matches!(
        stack.tokens.verify(&t1.token).await,
        Err(AppError::UnknownKid(_))
    ));
}

#[tokio::test]
async fn test_back_to_back_rotation_keeps_previous_active() {
    let stack = TestStack::with_policy(RotationPolicy {
        max_keys_in_jwks: 2,
        ..test_policy()
    })
    .await;

    let k1 = stack.key_manager.ensure_active_key().await.unwrap().kid;
    let k2 = stack.key_manager.rotate_key().await.unwrap().new_kid;
    let k3 = stack.key_manager.rotate_key().await.unwrap().new_kid;

    assert_eq!(
        stack.key_manager.get_active_key().await.unwrap().kid,
        k3
    );
    assert_eq!(
        stack.key_manager.get_key(&k2).await.unwrap().unwrap().status,
        KeyStatus::Grace
    );
    assert_eq!(
        stack.key_manager.get_key(&k1).await.unwrap().unwrap().status,
        KeyStatus::Retired
    );

    let kids: Vec<String> = published(&stack).await.keys.into_iter().map(|k| k.kid).collect();
    let mut expected = vec![k2, k3];
    expected.sort();
    assert_eq!(kids, expected);
}

#[tokio::test]
async fn test_jwks_conditional_fetch() {
    let stack = TestStack::new().await;
    stack.key_manager.ensure_active_key().await.unwrap();

    let first = match stack.key_manager.build_jwks(None).await.unwrap() {
        JwksSnapshot::Changed(p) => p,
        JwksSnapshot::Unchanged(_) => panic!("expected body"),
    };
    assert!(matches!(
        stack
            .key_manager
            .build_jwks(Some(&first.tag.etag))
            .await
            .unwrap(),
        JwksSnapshot::Unchanged(_)
    ));

    stack.key_manager.rotate_key().await.unwrap();
    match stack
        .key_manager
        .build_jwks(Some(&first.tag.etag))
        .await
        .unwrap()
    {
        JwksSnapshot::Changed(p) => {
            assert_ne!(p.tag.etag, first.tag.etag);
            let jwks: Jwks = serde_json::from_slice(&p.body).unwrap();
            assert_eq!(jwks.keys.len(), 2);
            assert!(jwks.keys.windows(2).all(|w| w[0].kid < w[1].kid));
            assert!(jwks.keys.iter().all(|k| k.kty == "RSA" && k.alg == "RS256"));
        }
        JwksSnapshot::Unchanged(_) => panic!("rotation must change the JWKS"),
    }
}

#[tokio::test]
async fn test_expired_keys_are_deleted_with_private_material() {
    let stack = TestStack::new().await;
    let k1 = stack.key_manager.ensure_active_key().await.unwrap().kid;
    stack.key_manager.rotate_key().await.unwrap();
    assert!(resolve_signing_key(&stack.private_keys, &k1, SigningAlgorithm::RS256)
        .await
        .is_ok());

    // 超过 not_after = not_before + 轮换周期 + 宽限期
    stack.clock.advance(Duration::days(38));
    let outcome = stack.key_manager.rotate_key().await.unwrap();

    assert!(outcome.deleted.contains(&k1));
    assert!(stack.key_manager.get_key(&k1).await.unwrap().is_none());
    assert!(resolve_signing_key(&stack.private_keys, &k1, SigningAlgorithm::RS256)
        .await
        .is_err());
    // 新的 Active 仍然可用
    stack.tokens.issue_access(&subject(), None).await.unwrap();
}

#[tokio::test]
async fn test_refresh_token_flow() {
    let stack = TestStack::new().await;
    stack.key_manager.ensure_active_key().await.unwrap();
    let ctx = iam_core::context::OpContext::background();

    let pair = stack.keys.issue_pair(&ctx, &subject()).await.unwrap();
    assert_eq!(pair.token_type, "Bearer");
    assert_eq!(pair.expires_in, 15 * 60);

    // 刷新令牌不能当访问令牌用
    assert!(matches!(
        stack.keys.verify(&ctx, &pair.refresh_token).await,
        Err(AppError::MalformedClaims(_))
    ));

    let next = stack.keys.refresh(&ctx, &pair.refresh_token).await.unwrap();
    let claims = stack.keys.verify(&ctx, &next.access_token).await.unwrap();
    assert_eq!(claims.account_id, "acct-1");

    assert!(stack.keys.refresh(&ctx, &pair.refresh_token).await.is_err());
}

#[tokio::test]
async fn test_access_token_expires_at_ttl() {
    let stack = TestStack::new().await;
    stack.key_manager.ensure_active_key().await.unwrap();

    let token = stack
        .tokens
        .issue_access(&subject(), Some(Duration::seconds(60)))
        .await
        .unwrap();

    stack.clock.advance(Duration::seconds(59));
    stack.tokens.verify(&token.token).await.unwrap();

    // 默认 30 秒容差不延长有效期
    stack.clock.advance(Duration::seconds(1));
    assert!(matches!(
        stack.tokens.verify(&token.token).await,
        Err(AppError::Expired)
    ));
}

// ==================== Scheduler ====================

#[tokio::test]
async fn test_scheduler_start_stop() {
    let stack = TestStack::new().await;
    let scheduler = RotationScheduler::new(
        stack.key_manager.clone(),
        RotationSchedule::Interval(std::time::Duration::from_millis(20)),
    );
    let root = CancellationToken::new();

    scheduler.start(&root).await.unwrap();
    assert!(scheduler.is_running());
    assert!(matches!(
        scheduler.start(&root).await,
        Err(AppError::InvalidState(_))
    ));

    // 首个 tick 立即执行，没有 Active 时生成一把
    let mut created = false;
    for _ in 0..100 {
        if stack.key_manager.key_stats().await.unwrap().active == 1 {
            created = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(created);

    // 时钟未推进，后续 tick 不会再轮换
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(stack.key_manager.key_stats().await.unwrap().total, 1);

    scheduler.stop().await;
    assert!(!scheduler.is_running());
    assert!(scheduler.next_run().is_none());

    // 可以重新启动
    scheduler.start(&root).await.unwrap();
    root.cancel();
    scheduler.stop().await;
}

#[tokio::test]
async fn test_trigger_now_rotates_only_when_due() {
    let stack = TestStack::new().await;
    let scheduler = Arc::new(RotationScheduler::new(
        stack.key_manager.clone(),
        RotationSchedule::Interval(std::time::Duration::from_secs(3600)),
    ));

    let first = scheduler.trigger_now().await.unwrap();
    assert!(first.is_some());
    assert!(scheduler.trigger_now().await.unwrap().is_none());

    stack.clock.advance(Duration::days(30));
    let due = scheduler.trigger_now().await.unwrap().unwrap();
    assert_eq!(due.demoted, vec![first.unwrap().new_kid]);
}
