//! Unit tests for the matching scheduler

use pretty_assertions::assert_eq;
use rstest::*;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use order_matcher::scheduler::{TickOutcome, TickReport};
use order_matcher::{OrderStatus, Side};

use crate::common::{TICKER, TestExchange};
use crate::init_test_logging;

#[fixture]
fn exchange() -> TestExchange {
    init_test_logging();
    TestExchange::new()
}

fn completed(outcome: TickOutcome) -> TickReport {
    match outcome {
        TickOutcome::Completed(report) => report,
        other => panic!("expected a completed tick, got {other:?}"),
    }
}

#[rstest]
#[tokio::test]
async fn test_market_closed_tick_touches_nothing(exchange: TestExchange) {
    exchange.sell(TICKER, dec!(100), dec!(10)).await;
    exchange.buy(TICKER, dec!(100), dec!(10)).await;
    exchange.market.set_open(false);

    let calls_before = exchange.index.calls();
    let outcome = exchange.service.run_tick().await;

    assert_eq!(outcome, TickOutcome::MarketClosed);
    assert_eq!(exchange.index.calls(), calls_before);
    assert!(exchange.store.all_executions().is_empty());
    assert_eq!(exchange.service.metrics().ticks_market_closed, 1);
}

#[rstest]
#[tokio::test]
async fn test_tick_matches_when_open(exchange: TestExchange) {
    let sell = exchange.sell(TICKER, dec!(100), dec!(10)).await;
    let buy = exchange.buy(TICKER, dec!(100), dec!(10)).await;

    let report = completed(exchange.service.run_tick().await);
    assert_eq!(report.tickers, 1);
    assert_eq!(report.fills, 1);
    assert_eq!(report.executed_amount, dec!(10));
    // The filled sell left the index before the sell pass listed ids
    assert_eq!(report.orders_processed, 1);
    assert_eq!(report.orders_failed, 0);

    assert_eq!(exchange.order(buy.id).await.status, OrderStatus::Filled);
    assert_eq!(exchange.order(sell.id).await.status, OrderStatus::Filled);
}

#[rstest]
#[tokio::test]
async fn test_partially_consumed_sell_gets_its_own_turn(exchange: TestExchange) {
    let sell = exchange.sell(TICKER, dec!(100), dec!(10)).await;
    let low_bid = exchange.buy(TICKER, dec!(99), dec!(10)).await;
    let bid = exchange.buy(TICKER, dec!(100), dec!(4)).await;

    let report = completed(exchange.service.run_tick().await);
    // Both bids, then the sell, which finds no bid at or above 100
    assert_eq!(report.orders_processed, 3);
    assert_eq!(report.fills, 1);
    assert_eq!(report.executed_amount, dec!(4));

    let sell_now = exchange.order(sell.id).await;
    assert_eq!(sell_now.status, OrderStatus::PartiallyFilled);
    assert_eq!(sell_now.remaining_amount, dec!(6));
    assert_eq!(exchange.order(bid.id).await.status, OrderStatus::Filled);
    assert_eq!(exchange.order(low_bid.id).await.status, OrderStatus::Open);
    assert_eq!(exchange.waiting(Side::Sell, TICKER).await, vec![sell.id]);
    assert_eq!(exchange.waiting(Side::Buy, TICKER).await, vec![low_bid.id]);
}

#[rstest]
#[tokio::test]
async fn test_buys_drained_before_sells(exchange: TestExchange) {
    // Both sells would match the bid; the buy's pass takes the cheaper ask first
    let cheap = exchange.sell(TICKER, dec!(99), dec!(5)).await;
    let dear = exchange.sell(TICKER, dec!(100), dec!(5)).await;
    let bid = exchange.buy(TICKER, dec!(100), dec!(5)).await;

    let report = completed(exchange.service.run_tick().await);
    assert_eq!(report.fills, 1);

    let executions = exchange.service.executions_for(bid.id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].counter_order_id, cheap.id);
    assert_eq!(executions[0].executed_price, dec!(99));
    assert_eq!(exchange.waiting(Side::Sell, TICKER).await, vec![dear.id]);
}

#[rstest]
#[tokio::test]
async fn test_failed_order_does_not_block_others(exchange: TestExchange) {
    let poisoned = exchange.buy(TICKER, dec!(101), dec!(5)).await;
    let healthy = exchange.buy(TICKER, dec!(100), dec!(5)).await;
    let sell = exchange.sell(TICKER, dec!(100), dec!(5)).await;
    exchange.store.poison(poisoned.id);

    let report = completed(exchange.service.run_tick().await);
    assert_eq!(report.orders_failed, 1);
    assert_eq!(report.fills, 1);

    assert_eq!(exchange.order(healthy.id).await.status, OrderStatus::Filled);
    assert_eq!(exchange.order(sell.id).await.status, OrderStatus::Filled);
    assert_eq!(exchange.service.metrics().orders_failed, 1);
}

#[rstest]
#[tokio::test]
async fn test_index_outage_is_retryable(exchange: TestExchange) {
    exchange.buy(TICKER, dec!(100), dec!(5)).await;
    exchange.sell(TICKER, dec!(100), dec!(5)).await;

    exchange.index.set_unavailable(true);
    assert_eq!(exchange.service.run_tick().await, TickOutcome::IndexUnavailable);
    assert!(exchange.store.all_executions().is_empty());

    exchange.index.set_unavailable(false);
    let report = completed(exchange.service.run_tick().await);
    assert_eq!(report.fills, 1);
}

#[rstest]
#[tokio::test]
async fn test_overlapping_tick_is_skipped(exchange: TestExchange) {
    let exchange = Arc::new(exchange);
    exchange.buy(TICKER, dec!(100), dec!(5)).await;
    exchange.sell(TICKER, dec!(100), dec!(5)).await;
    exchange.index.set_gated(true);

    let first = {
        let exchange = exchange.clone();
        tokio::spawn(async move { exchange.service.run_tick().await })
    };
    exchange.index.entered.notified().await;

    assert_eq!(exchange.service.run_tick().await, TickOutcome::Overlapped);

    exchange.index.set_gated(false);
    exchange.index.release.notify_one();
    let report = completed(first.await.unwrap());
    assert_eq!(report.fills, 1);
    assert_eq!(exchange.service.metrics().ticks_overlapped, 1);
}

#[rstest]
#[tokio::test]
async fn test_tickers_are_independent(exchange: TestExchange) {
    exchange.sell("005930", dec!(100), dec!(5)).await;
    exchange.buy("005930", dec!(100), dec!(5)).await;
    let lonely = exchange.buy("000660", dec!(50), dec!(5)).await;
    exchange.sell("035420", dec!(10), dec!(1)).await;
    exchange.buy("035420", dec!(11), dec!(1)).await;

    let report = completed(exchange.service.run_tick().await);
    assert_eq!(report.tickers, 3);
    assert_eq!(report.fills, 2);
    assert_eq!(exchange.waiting(Side::Buy, "000660").await, vec![lonely.id]);
}

#[rstest]
#[tokio::test]
async fn test_started_loop_matches_and_stops(exchange: TestExchange) {
    let sell = exchange.sell(TICKER, dec!(100), dec!(5)).await;
    exchange.buy(TICKER, dec!(100), dec!(5)).await;

    exchange.service.start().await.unwrap();

    let filled = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if exchange.order(sell.id).await.status == OrderStatus::Filled {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(filled.is_ok(), "scheduler never matched the book");

    exchange.service.shutdown().await;
    let ticks = exchange.service.metrics().ticks_run;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(exchange.service.metrics().ticks_run, ticks);
}
