//! Integration tests for complete order workflows

use pretty_assertions::assert_eq;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use order_matcher::scheduler::TickOutcome;
use order_matcher::waiting_index::WaitingOrderIndex;
use order_matcher::{MatchError, MatchingService, OrderStatus, Side};

use crate::common::{TICKER, TestExchange, create_test_config, order_request};
use crate::init_test_logging;

#[tokio::test]
async fn test_submit_match_and_notify_workflow() {
    init_test_logging();
    let exchange = TestExchange::new();
    let mut fills = exchange.service.subscribe();

    let sell = exchange.sell(TICKER, dec!(71500), dec!(10)).await;
    let buy = exchange.buy(TICKER, dec!(71600), dec!(4)).await;
    assert_eq!(exchange.waiting(Side::Sell, TICKER).await, vec![sell.id]);
    assert_eq!(exchange.waiting(Side::Buy, TICKER).await, vec![buy.id]);

    let outcome = exchange.service.run_tick().await;
    assert!(matches!(outcome, TickOutcome::Completed(_)));

    let event = fills.recv().await.unwrap();
    assert_eq!(event.ticker, TICKER);
    assert_eq!(event.buy_order_id, buy.id);
    assert_eq!(event.sell_order_id, sell.id);
    assert_eq!(event.price, dec!(71500));
    assert_eq!(event.amount, dec!(4));

    let buy_now = exchange.order(buy.id).await;
    assert_eq!(buy_now.status, OrderStatus::Filled);
    assert_eq!(buy_now.avg_executed_price, Some(dec!(71500)));
    let sell_now = exchange.order(sell.id).await;
    assert_eq!(sell_now.status, OrderStatus::PartiallyFilled);
    assert_eq!(sell_now.remaining_amount, dec!(6));

    assert!(exchange.waiting(Side::Buy, TICKER).await.is_empty());
    assert_eq!(exchange.waiting(Side::Sell, TICKER).await, vec![sell.id]);
}

#[tokio::test]
async fn test_partially_filled_order_completes_over_ticks() {
    init_test_logging();
    let exchange = TestExchange::new();
    let sell = exchange.sell(TICKER, dec!(100), dec!(10)).await;

    exchange.buy(TICKER, dec!(100), dec!(3)).await;
    exchange.service.run_tick().await;
    exchange.buy(TICKER, dec!(101), dec!(7)).await;
    exchange.service.run_tick().await;

    let sell_now = exchange.order(sell.id).await;
    assert_eq!(sell_now.status, OrderStatus::Filled);
    assert_eq!(sell_now.executed_amount, dec!(10));
    assert_eq!(sell_now.avg_executed_price, Some(dec!(100)));

    let executions = exchange.service.executions_for(sell.id).await.unwrap();
    let total: Decimal = executions.iter().map(|e| e.executed_amount).sum();
    assert_eq!(executions.len(), 2);
    assert_eq!(total, sell_now.amount - sell_now.remaining_amount);
    assert!(exchange.waiting(Side::Sell, TICKER).await.is_empty());
}

#[tokio::test]
async fn test_cancelled_order_never_fills() {
    init_test_logging();
    let exchange = TestExchange::new();
    let sell = exchange.sell(TICKER, dec!(100), dec!(10)).await;
    let buy = exchange.buy(TICKER, dec!(100), dec!(10)).await;

    let cancelled = exchange.service.cancel_order(sell.id).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(exchange.waiting(Side::Sell, TICKER).await.is_empty());

    exchange.service.run_tick().await;
    assert_eq!(exchange.order(buy.id).await.status, OrderStatus::Open);
    assert!(exchange.store.all_executions().is_empty());
    assert_eq!(exchange.waiting(Side::Buy, TICKER).await, vec![buy.id]);
}

#[tokio::test]
async fn test_filled_order_cannot_be_cancelled() {
    init_test_logging();
    let exchange = TestExchange::new();
    let sell = exchange.sell(TICKER, dec!(100), dec!(1)).await;
    exchange.buy(TICKER, dec!(100), dec!(1)).await;
    exchange.service.run_tick().await;

    let result = exchange.service.cancel_order(sell.id).await;
    assert!(matches!(result, Err(MatchError::InvalidTransition { .. })));
    assert_eq!(exchange.order(sell.id).await.status, OrderStatus::Filled);
}

#[tokio::test]
async fn test_cancel_survives_index_outage() {
    init_test_logging();
    let exchange = TestExchange::new();
    let sell = exchange.sell(TICKER, dec!(100), dec!(5)).await;
    let buy = exchange.buy(TICKER, dec!(100), dec!(5)).await;

    exchange.index.set_unavailable(true);
    let cancelled = exchange.service.cancel_order(sell.id).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    exchange.index.set_unavailable(false);

    // The stale entry is still indexed; the tick drops it instead of filling it
    assert_eq!(exchange.waiting(Side::Sell, TICKER).await, vec![sell.id]);
    exchange.service.run_tick().await;
    assert!(exchange.waiting(Side::Sell, TICKER).await.is_empty());
    assert_eq!(exchange.order(buy.id).await.status, OrderStatus::Open);
}

#[tokio::test]
async fn test_submission_rolled_back_when_index_down() {
    init_test_logging();
    let exchange = TestExchange::new();
    exchange.index.set_unavailable(true);

    let result = exchange
        .service
        .submit_order(order_request(TICKER, Side::Buy, dec!(100), dec!(1)))
        .await;
    assert!(matches!(result, Err(MatchError::IndexUnavailable(_))));
    assert_eq!(exchange.service.metrics().orders_submitted, 0);
}

#[tokio::test]
async fn test_universe_is_enforced() {
    init_test_logging();
    let mut config = create_test_config();
    config.matching.universe = vec![TICKER.to_string()];
    let exchange = TestExchange::with_config(&config);

    let rejected = exchange
        .service
        .submit_order(order_request("999999", Side::Buy, dec!(1), dec!(1)))
        .await;
    assert!(matches!(rejected, Err(MatchError::InvalidOrder { .. })));

    let accepted = exchange
        .service
        .submit_order(order_request(TICKER, Side::Buy, dec!(1), dec!(1)))
        .await;
    assert!(accepted.is_ok());
}

#[tokio::test]
async fn test_restart_reconciles_index() {
    init_test_logging();
    let exchange = TestExchange::new();
    let sell = exchange.sell(TICKER, dec!(100), dec!(5)).await;
    let buy = exchange.buy(TICKER, dec!(100), dec!(5)).await;

    // Simulate a crash between order insert and enqueue
    exchange.index.remove(Side::Buy, TICKER, buy.id).await.unwrap();

    let restarted = MatchingService::with_components(
        &create_test_config(),
        exchange.store.clone(),
        exchange.index.clone(),
        exchange.market.clone(),
    )
    .unwrap();
    let stats = restarted.recover().await.unwrap();

    assert_eq!(stats.live_orders, 2);
    assert_eq!(stats.orders_enqueued, 1);
    assert_eq!(stats.stale_removed, 0);
    assert_eq!(exchange.waiting(Side::Buy, TICKER).await, vec![buy.id]);

    restarted.run_tick().await;
    assert_eq!(restarted.get_order(sell.id).await.unwrap().status, OrderStatus::Filled);
}

#[tokio::test]
async fn test_missing_order_lookup() {
    init_test_logging();
    let exchange = TestExchange::new();
    let result = exchange.service.get_order(order_matcher::OrderId(12345)).await;
    assert!(matches!(result, Err(MatchError::OrderNotFound { order_id: 12345 })));
}
