mod common;

use chrono::Duration;
use common::{harness, t0, BACKENDS};
use helpdesk_contracts::{Actor, SweepReport, TicketStatus};

#[tokio::test]
async fn silent_ticket_closes_after_the_window() {
    for backend in BACKENDS {
        let h = harness(backend).await;
        let ticket = h.in_progress_ticket("no reply ever").await;
        let scheduler = h.desk.scheduler(&h.cfg.scheduler);

        h.clock.set(t0() + Duration::days(1));
        let report = scheduler.run_once().await;
        assert_eq!(
            report,
            SweepReport {
                scanned: 1,
                closed: 0,
                skipped: 1,
                failed: 0
            },
            "{backend}"
        );

        h.clock.set(t0() + Duration::days(3));
        let report = scheduler.run_once().await;
        assert_eq!(report.closed, 1);
        let stored = h.desk.get_ticket(ticket.ticket_id).await.unwrap();
        assert_eq!(stored.status, TicketStatus::Closed);
        assert_eq!(stored.closed_at, Some(t0() + Duration::days(3)));
    }
}

#[tokio::test]
async fn exactly_the_window_is_not_inactive() {
    for backend in BACKENDS {
        let h = harness(backend).await;
        let ticket = h.in_progress_ticket("boundary").await;
        let scheduler = h.desk.scheduler(&h.cfg.scheduler);

        h.clock.set(t0() + Duration::hours(48));
        scheduler.run_once().await;
        assert_eq!(
            h.desk.get_ticket(ticket.ticket_id).await.unwrap().status,
            TicketStatus::InProgress,
            "{backend}"
        );

        h.clock.advance(Duration::seconds(1));
        scheduler.run_once().await;
        assert_eq!(
            h.desk.get_ticket(ticket.ticket_id).await.unwrap().status,
            TicketStatus::Closed
        );
    }
}

#[tokio::test]
async fn staff_replies_do_not_keep_a_ticket_alive() {
    for backend in BACKENDS {
        let h = harness(backend).await;
        let ticket = h.in_progress_ticket("staff keeps talking").await;
        h.desk
            .append_reply(ticket.ticket_id, Actor::Customer(h.customer), "any news?", None)
            .await
            .unwrap();
        h.clock.set(t0() + Duration::days(1));
        h.desk
            .append_reply(ticket.ticket_id, Actor::Staff(h.tech), "working on it", None)
            .await
            .unwrap();
        let scheduler = h.desk.scheduler(&h.cfg.scheduler);

        h.clock.set(t0() + Duration::hours(47));
        assert_eq!(scheduler.run_once().await.closed, 0, "{backend}");

        h.clock.set(t0() + Duration::days(2) + Duration::hours(1));
        assert_eq!(scheduler.run_once().await.closed, 1);
        assert_eq!(
            h.desk.get_ticket(ticket.ticket_id).await.unwrap().status,
            TicketStatus::Closed
        );
    }
}

#[tokio::test]
async fn late_customer_reply_moves_the_anchor() {
    for backend in BACKENDS {
        let h = harness(backend).await;
        let ticket = h.in_progress_ticket("customer came back").await;
        h.clock.set(t0() + Duration::hours(60));
        h.desk
            .append_reply(ticket.ticket_id, Actor::Customer(h.customer), "still there", None)
            .await
            .unwrap();
        let scheduler = h.desk.scheduler(&h.cfg.scheduler);

        h.clock.set(t0() + Duration::days(3));
        assert_eq!(scheduler.run_once().await.closed, 0, "{backend}");
        assert_eq!(
            h.desk.get_ticket(ticket.ticket_id).await.unwrap().status,
            TicketStatus::InProgress
        );

        h.clock.set(t0() + Duration::hours(60 + 49));
        assert_eq!(scheduler.run_once().await.closed, 1);
    }
}

#[tokio::test]
async fn reopen_restarts_the_activity_clock() {
    for backend in BACKENDS {
        let h = harness(backend).await;
        let ticket = h.closed_ticket("came back").await;
        h.clock.set(t0() + Duration::days(10));
        let reopened = h
            .desk
            .reopen_ticket(ticket.ticket_id, Actor::Staff(h.tech))
            .await
            .unwrap();
        assert_eq!(reopened.status, TicketStatus::InProgress, "{backend}");
        let scheduler = h.desk.scheduler(&h.cfg.scheduler);

        h.clock.set(t0() + Duration::days(11));
        assert_eq!(scheduler.run_once().await.closed, 0, "{backend}");

        h.clock.set(t0() + Duration::days(13));
        assert_eq!(scheduler.run_once().await.closed, 1);
        let stored = h.desk.get_ticket(ticket.ticket_id).await.unwrap();
        assert_eq!(stored.reopened_at, Some(t0() + Duration::days(10)));
        assert_eq!(stored.closed_at, Some(t0() + Duration::days(13)));
    }
}

#[tokio::test]
async fn only_in_progress_tickets_are_swept() {
    for backend in BACKENDS {
        let h = harness(backend).await;
        let open = h.open_ticket("open").await;
        let assigned = h.open_ticket("assigned").await;
        h.desk
            .assign_ticket(assigned.ticket_id, h.tech, h.lead, None)
            .await
            .unwrap();
        let resolved = h.in_progress_ticket("resolved").await;
        h.desk
            .resolve_ticket(resolved.ticket_id, h.tech)
            .await
            .unwrap();

        h.clock.set(t0() + Duration::days(30));
        let report = h.desk.scheduler(&h.cfg.scheduler).run_once().await;
        assert_eq!(report.scanned, 0, "{backend}");

        for (id, status) in [
            (open.ticket_id, TicketStatus::Open),
            (assigned.ticket_id, TicketStatus::Assigned),
            (resolved.ticket_id, TicketStatus::Resolved),
        ] {
            assert_eq!(h.desk.get_ticket(id).await.unwrap().status, status);
        }
    }
}

#[tokio::test]
async fn sweep_pages_through_every_candidate() {
    for backend in BACKENDS {
        let h = harness(backend).await;
        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(h.in_progress_ticket(&format!("batch {n}")).await.ticket_id);
        }
        let active = h.in_progress_ticket("active").await;

        h.clock.set(t0() + Duration::days(3));
        h.desk
            .append_reply(active.ticket_id, Actor::Customer(h.customer), "hello", None)
            .await
            .unwrap();

        let mut cfg = h.cfg.scheduler.clone();
        cfg.batch_size = 2;
        let report = h.desk.scheduler(&cfg).run_once().await;
        assert_eq!(
            report,
            SweepReport {
                scanned: 6,
                closed: 5,
                skipped: 1,
                failed: 0
            },
            "{backend}"
        );
        for id in ids {
            assert_eq!(
                h.desk.get_ticket(id).await.unwrap().status,
                TicketStatus::Closed
            );
        }

        let again = h.desk.scheduler(&cfg).run_once().await;
        assert_eq!(again.scanned, 1);
        assert_eq!(again.closed, 0);
    }
}

#[tokio::test]
async fn undecodable_ticket_does_not_stall_the_sweep() {
    let h = harness("sqlite").await;
    let mut ids = Vec::new();
    for n in 0..3 {
        ids.push(h.in_progress_ticket(&format!("row {n}")).await.ticket_id);
    }
    let db_path = h.cfg.store.sqlite_path.clone().unwrap();
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute(
        "UPDATE tickets SET priority = 'URGENT' WHERE ticket_id = ?1",
        [ids[0].0],
    )
    .unwrap();
    drop(conn);

    h.clock.set(t0() + Duration::days(3));
    let report = h.desk.scheduler(&h.cfg.scheduler).run_once().await;
    assert_eq!(
        report,
        SweepReport {
            scanned: 3,
            closed: 2,
            skipped: 0,
            failed: 1
        }
    );
    for id in &ids[1..] {
        assert_eq!(
            h.desk.get_ticket(*id).await.unwrap().status,
            TicketStatus::Closed
        );
    }
    assert!(h.desk.get_ticket(ids[0]).await.is_err());
}

#[tokio::test]
async fn manually_closed_tickets_are_left_alone() {
    for backend in BACKENDS {
        let h = harness(backend).await;
        let ticket = h.in_progress_ticket("closed by hand").await;
        h.clock.set(t0() + Duration::days(1));
        h.desk
            .close_ticket(ticket.ticket_id, Actor::Staff(h.tech))
            .await
            .unwrap();

        h.clock.set(t0() + Duration::days(5));
        let report = h.desk.scheduler(&h.cfg.scheduler).run_once().await;
        assert_eq!(report.scanned, 0, "{backend}");
        assert_eq!(
            h.desk.get_ticket(ticket.ticket_id).await.unwrap().closed_at,
            Some(t0() + Duration::days(1))
        );
    }
}

#[tokio::test(start_paused = true)]
async fn scheduler_loop_sweeps_and_stops_on_shutdown() {
    let h = harness("memory").await;
    let ticket = h.in_progress_ticket("loop").await;
    h.clock.set(t0() + Duration::days(3));

    let mut cfg = h.cfg.scheduler.clone();
    cfg.run_on_start = true;
    cfg.interval_secs = 60;
    let scheduler = h.desk.scheduler(&cfg);
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        scheduler
            .run_until(async {
                let _ = stop_rx.await;
            })
            .await;
    });

    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    assert_eq!(
        h.desk.get_ticket(ticket.ticket_id).await.unwrap().status,
        TicketStatus::Closed
    );

    stop_tx.send(()).unwrap();
    task.await.unwrap();
}
