//! Kairos demo CLI
//!
//! Runs a seeded scenario on the simulation kernel and prints the run
//! summary. The same seed always prints the same result.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use kairos::{
    dispatch_after, ActionResult, SimConfig, Simulation, StateMachine, Step, Tagged,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Two players driven by state machines.
    TableTennis,
    /// Two processes passing a token over rendezvous channels.
    Relay,
}

/// Kairos discrete-event simulation demo
#[derive(Parser, Debug)]
#[command(name = "kairos")]
#[command(about = "Run a deterministic discrete-event simulation scenario", long_about = None)]
struct Args {
    /// Scenario to run
    #[arg(short = 'S', long, value_enum, default_value = "table-tennis")]
    scenario: Scenario,

    /// Simulated time to run until
    #[arg(short, long, default_value = "30")]
    until: f64,

    /// Seed for the scenario's random delays
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Sampling interval (0 disables sample ticks)
    #[arg(long, default_value = "0")]
    sample_rate: f64,

    /// Verbose output (`RUST_LOG` takes precedence when set)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(args.verbose)));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    info!("Kairos v{}", env!("CARGO_PKG_VERSION"));
    info!("scenario={:?} seed={} until={}", args.scenario, args.seed, args.until);

    let config = SimConfig::new().sample_rate(args.sample_rate).with_trace();
    let sim = Simulation::with_config(config)?;
    let rng = Rc::new(RefCell::new(ChaCha8Rng::seed_from_u64(args.seed)));

    match args.scenario {
        Scenario::TableTennis => table_tennis(&sim, rng, args.until)?,
        Scenario::Relay => relay(&sim, rng, args.until)?,
    }

    if let Some(trace) = sim.trace() {
        info!("{} dispatches traced", trace.len());
        for entry in &trace {
            debug!("  {entry}");
        }
    }
    println!("{}", sim.reset(0.0, 0.0)?);
    Ok(())
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

// ── Table tennis ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Player {
    Idle,
    Waiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stroke {
    Serve,
    Return,
    Miss,
}

impl Tagged for Stroke {
    type Kind = Stroke;

    fn kind(&self) -> Stroke {
        *self
    }
}

type Machine = StateMachine<Player, Stroke, Side>;

struct Side {
    name: &'static str,
    skill: f64,
    points: u32,
    rng: Rc<RefCell<ChaCha8Rng>>,
    opponent: Weak<RefCell<Machine>>,
}

fn hit(step: &mut Step<'_, Player, Side>, stroke: Stroke) -> ActionResult {
    let opponent = step
        .model()
        .opponent
        .upgrade()
        .context("opponent left the table")?;
    let flight = step.model().rng.borrow_mut().gen_range(0.8..1.2);
    dispatch_after(&opponent, step.sim(), flight, stroke)?;
    Ok(())
}

fn volley(step: &mut Step<'_, Player, Side>, incoming: Stroke) -> ActionResult {
    let skill = step.model().skill;
    let returned = step.model().rng.borrow_mut().gen_bool(skill);
    debug!(t = %step.now(), player = step.model().name, ?incoming, returned);
    if returned {
        step.set_state(Player::Waiting);
        hit(step, Stroke::Return)
    } else {
        step.set_state(Player::Idle);
        hit(step, Stroke::Miss)
    }
}

fn score(step: &mut Step<'_, Player, Side>, _: Stroke) -> ActionResult {
    step.model_mut().points += 1;
    info!(t = %step.now(), player = step.model().name, points = step.model().points, "point");
    step.set_state(Player::Waiting);
    hit(step, Stroke::Serve)
}

fn player(
    name: &'static str,
    skill: f64,
    initial: Player,
    rng: &Rc<RefCell<ChaCha8Rng>>,
) -> Machine {
    let side = Side {
        name,
        skill,
        points: 0,
        rng: Rc::clone(rng),
        opponent: Weak::new(),
    };
    StateMachine::new(initial, side)
        .on(Player::Idle, Stroke::Serve, volley)
        .on(Player::Idle, Stroke::Return, volley)
        .on(Player::Waiting, Stroke::Return, volley)
        .on(Player::Waiting, Stroke::Miss, score)
}

fn table_tennis(sim: &Simulation, rng: Rc<RefCell<ChaCha8Rng>>, until: f64) -> anyhow::Result<()> {
    // Ping serves first, so it starts out waiting for the return.
    let ping = player("ping", 0.85, Player::Waiting, &rng).shared();
    let pong = player("pong", 0.80, Player::Idle, &rng).shared();
    ping.borrow_mut().model_mut().opponent = Rc::downgrade(&pong);
    pong.borrow_mut().model_mut().opponent = Rc::downgrade(&ping);

    dispatch_after(&pong, sim, 0.0, Stroke::Serve)?;

    let summary = sim.run(until)?;
    println!("{summary}");
    for machine in [&ping, &pong] {
        let machine = machine.borrow();
        println!(
            "  {}: {} points, {} undefined transitions",
            machine.model().name,
            machine.model().points,
            machine.undefined_count()
        );
    }
    Ok(())
}

// ── Relay ─────────────────────────────────────────────────────────────

fn relay(sim: &Simulation, rng: Rc<RefCell<ChaCha8Rng>>, until: f64) -> anyhow::Result<()> {
    let ping = sim.channel::<u64>(0);
    let pong = sim.channel::<u64>(0);
    let produced = Rc::new(Cell::new(1u64));
    let consumed = Rc::new(Cell::new(0u64));

    for (index, (rx, tx)) in [(pong.clone(), ping.clone()), (ping.clone(), pong.clone())]
        .into_iter()
        .enumerate()
    {
        let (made, used, rng) = (Rc::clone(&produced), Rc::clone(&consumed), Rc::clone(&rng));
        sim.launch(move |p| async move {
            if index == 0 {
                tx.put(0).await;
            }
            loop {
                let token = rx.take().await;
                used.set(used.get() + 1);
                made.set(made.get() + 1);
                let hold = rng.borrow_mut().gen_range(0.5..1.5);
                debug!(t = %p.now(), process = %p.id(), token, hold);
                p.delay(hold).await?;
                tx.put(token + 1).await;
            }
        });
    }

    let summary = sim.run(until)?;
    println!("{summary}");
    println!(
        "  produced {} messages, consumed {}, in flight {}",
        produced.get(),
        consumed.get(),
        produced.get() - consumed.get()
    );
    anyhow::ensure!(
        produced.get() == consumed.get() + 1,
        "message conservation violated"
    );
    Ok(())
}
