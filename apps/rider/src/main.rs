use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    HttpDirectory, HttpTripStore, InMemoryTripStore, SessionDependencies, SessionSettings,
    TripCommand, TripEvent, TripSession, TripStore,
};
use shared::{
    domain::{Actor, GeoPoint, Place, Role, TripId, UserId, VehicleInfo},
    trip::{TripDocument, TripRecord},
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rider", about = "Campus ride-hailing client")]
struct Cli {
    #[arg(long, default_value = "http://127.0.0.1:8787")]
    server_url: String,
    #[arg(long)]
    user_id: Option<i64>,
    #[arg(long, default_value = "customer")]
    role: Role,
    #[arg(long, default_value_t = 5)]
    route_timeout_secs: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a profile for `--role`.
    Register {
        #[arg(long)]
        name: String,
        #[arg(long, requires = "plate")]
        vehicle_model: Option<String>,
        #[arg(long)]
        plate: Option<String>,
    },
    Request {
        #[arg(long)]
        pickup: GeoPoint,
        #[arg(long, default_value = "Pickup")]
        pickup_label: String,
        #[arg(long)]
        dropoff: GeoPoint,
        #[arg(long, default_value = "Dropoff")]
        dropoff_label: String,
        /// Keep following the new trip after creating it.
        #[arg(long)]
        watch: bool,
    },
    /// Requests waiting for a driver.
    OpenRequests {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    Offer {
        trip_id: TripId,
        #[arg(long)]
        fare: f64,
    },
    Accept {
        trip_id: TripId,
    },
    Location {
        trip_id: TripId,
        point: GeoPoint,
    },
    ArrivePickup {
        trip_id: TripId,
    },
    Start {
        trip_id: TripId,
    },
    ArriveDropoff {
        trip_id: TripId,
    },
    Complete {
        trip_id: TripId,
    },
    Pay {
        trip_id: TripId,
    },
    Cancel {
        trip_id: TripId,
    },
    Review {
        trip_id: TripId,
        #[arg(long)]
        rating: u8,
        #[arg(long)]
        comment: Option<String>,
    },
    Chat {
        trip_id: TripId,
    },
    /// Print trip events as JSON lines until interrupted.
    Watch {
        trip_id: TripId,
    },
    /// Run one full trip against an in-memory store.
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let settings = SessionSettings {
        route_timeout: Duration::from_secs(cli.route_timeout_secs),
        ..SessionSettings::default()
    };

    match cli.command {
        Command::Register {
            ref name,
            ref vehicle_model,
            ref plate,
        } => {
            let vehicle = match (vehicle_model, plate) {
                (Some(model), Some(plate)) => Some(VehicleInfo {
                    model: model.clone(),
                    plate: plate.clone(),
                    color: None,
                }),
                _ => None,
            };
            let user_id = HttpDirectory::new(cli.server_url.as_str())
                .register(name, cli.role, vehicle)
                .await?;
            println!("Registered {} user_id={user_id}", cli.role.as_str());
        }
        Command::Request {
            pickup,
            ref pickup_label,
            dropoff,
            ref dropoff_label,
            watch,
        } => {
            let session = connect(&cli, settings)?;
            let trip_id = session
                .request_trip(
                    Place::new(pickup_label.as_str(), pickup),
                    Place::new(dropoff_label.as_str(), dropoff),
                )
                .await?;
            println!("Requested trip {trip_id}");
            if watch {
                follow(&session, trip_id).await?;
            }
        }
        Command::OpenRequests { limit } => {
            let store = HttpTripStore::new(cli.server_url.as_str());
            for record in store.open_requests(limit).await? {
                println!(
                    "{}  {} -> {}  customer={}",
                    record.trip_id, record.pickup.label, record.dropoff.label, record.customer_id
                );
            }
        }
        Command::Offer { trip_id, fare } => {
            run(&cli, settings, trip_id, TripCommand::MakeOffer { fare }).await?
        }
        Command::Accept { trip_id } => {
            run(&cli, settings, trip_id, TripCommand::AcceptOffer).await?
        }
        Command::Location { trip_id, point } => {
            run(&cli, settings, trip_id, TripCommand::UpdateLocation { point }).await?
        }
        Command::ArrivePickup { trip_id } => {
            run(&cli, settings, trip_id, TripCommand::ArriveAtPickup).await?
        }
        Command::Start { trip_id } => {
            run(&cli, settings, trip_id, TripCommand::StartTrip).await?
        }
        Command::ArriveDropoff { trip_id } => {
            run(&cli, settings, trip_id, TripCommand::ArriveAtDropoff).await?
        }
        Command::Complete { trip_id } => {
            run(&cli, settings, trip_id, TripCommand::CompleteTrip).await?
        }
        Command::Pay { trip_id } => run(&cli, settings, trip_id, TripCommand::Pay).await?,
        Command::Cancel { trip_id } => run(&cli, settings, trip_id, TripCommand::Cancel).await?,
        Command::Review {
            trip_id,
            rating,
            ref comment,
        } => {
            let session = connect(&cli, settings)?;
            session.open(trip_id).await?;
            let review = session.submit_review(rating, comment.clone()).await;
            session.close().await;
            let review = review?;
            println!(
                "Review {} recorded for driver {}",
                review.review_id, review.driver_id
            );
        }
        Command::Chat { trip_id } => {
            let session = connect(&cli, settings)?;
            session.open(trip_id).await?;
            let room = session.open_chat_room().await;
            session.close().await;
            println!("Chat room {}", room?);
        }
        Command::Watch { trip_id } => {
            let session = connect(&cli, settings)?;
            follow(&session, trip_id).await?;
        }
        Command::Demo => demo(settings).await?,
    }

    Ok(())
}

fn actor(cli: &Cli) -> Result<Actor> {
    let user_id = cli
        .user_id
        .map(UserId)
        .ok_or_else(|| anyhow!("--user-id is required for this command"))?;
    Ok(Actor {
        role: cli.role,
        user_id,
    })
}

fn connect(cli: &Cli, settings: SessionSettings) -> Result<Arc<TripSession>> {
    Ok(TripSession::new(
        actor(cli)?,
        SessionDependencies::http(&cli.server_url),
        settings,
    ))
}

async fn run(
    cli: &Cli,
    settings: SessionSettings,
    trip_id: TripId,
    command: TripCommand,
) -> Result<()> {
    let session = connect(cli, settings)?;
    let record = session
        .execute(trip_id, command)
        .await
        .with_context(|| format!("{command} on trip {trip_id}"))?;
    print_record(&record)
}

fn print_record(record: &TripRecord) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(&TripDocument::from(record))?
    );
    Ok(())
}

async fn follow(session: &Arc<TripSession>, trip_id: TripId) -> Result<()> {
    let mut events = session.subscribe_events();
    session.open(trip_id).await?;
    info!(%trip_id, "watching trip; ctrl-c to stop");
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    session.close().await;
    Ok(())
}

fn drain(events: &mut broadcast::Receiver<TripEvent>) -> Result<()> {
    loop {
        match events.try_recv() {
            Ok(event) => println!("{}", serde_json::to_string(&event)?),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "event stream lagged")
            }
            Err(_) => return Ok(()),
        }
    }
}

async fn demo(settings: SessionSettings) -> Result<()> {
    let store: Arc<dyn TripStore> = InMemoryTripStore::new();
    let customer = TripSession::new(
        Actor::customer(UserId(1)),
        SessionDependencies::offline(store.clone()),
        settings.clone(),
    );
    let driver = TripSession::new(
        Actor::driver(UserId(2)),
        SessionDependencies::offline(store),
        settings,
    );
    let mut events = customer.subscribe_events();

    let trip_id = customer
        .request_trip(
            Place::new("Main Quad", GeoPoint::new(40.1075, -88.2272)),
            Place::new("Illinois Terminal", GeoPoint::new(40.1156, -88.2410)),
        )
        .await?;
    customer.open(trip_id).await?;
    driver.open(trip_id).await?;

    driver.make_offer(9.5).await?;
    settle().await;
    customer.accept_offer().await?;
    settle().await;
    driver.report_location(GeoPoint::new(40.1090, -88.2300)).await?;
    driver.arrive_at_pickup().await?;
    settle().await;
    driver.start_trip().await?;
    driver.arrive_at_dropoff().await?;
    settle().await;
    driver.complete_trip().await?;
    customer.pay().await?;
    settle().await;

    drain(&mut events)?;
    customer.close().await;
    driver.close().await;
    Ok(())
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
