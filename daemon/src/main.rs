mod args;

use crate::args::{Args, SubCommand};
use clap::Parser;
use env_logger::Env;
use pkgbuilderd::recipe::RecipeTree;
use pkgbuilderd::transaction;
use pkgbuilderd::{handler, Engine};
use pkgbuilderd_common::config;
use pkgbuilderd_common::errors::*;
use std::collections::BTreeSet;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let logging = match args.verbose {
        0 => "info",
        1 => "pkgbuilderd=debug,pkgbuilderd_common=debug,info",
        2 => "debug",
        _ => "trace",
    };

    env_logger::init_from_env(Env::default().default_filter_or(logging));

    let config = config::load(args.config.as_deref())?;

    match args.subcommand {
        SubCommand::Run => {
            let engine = Engine::connect(config)?;
            handler::run_workers(Arc::new(engine)).await?;
        }
        SubCommand::Enqueue(enqueue) => {
            let engine = Engine::connect(config)?;
            let names = enqueue.packages.into_iter().collect::<BTreeSet<_>>();
            let tnum = engine.enqueue_transaction(names, enqueue.initiated_by)?;
            println!("{}", tnum);

            if enqueue.now {
                if engine.status.take_transaction(tnum)? {
                    let txn = engine.run_transaction(tnum).await?;
                    println!("builds: {:?}", txn.builds);
                    println!("completed: {:?}", txn.completed);
                    println!("failed: {:?}", txn.failed);
                } else {
                    warn!("Transaction {} was already picked up by a worker", tnum);
                }
            }
        }
        SubCommand::Review(review) => {
            let engine = Engine::connect(config)?;
            let build = engine.set_review_result(review.bnum, &review.reviewer, review.result).await?;
            info!("Build {} of {} reviewed as {}", build.bnum, build.pkgname, build.review_status);
        }
        SubCommand::SyncRepo(sync) => {
            let engine = Engine::connect(config)?;
            let states = if let Some(arch) = sync.arch {
                vec![engine.sync_repo(&sync.repo, &arch).await?]
            } else {
                engine.repos.sync_all(&sync.repo).await?
            };
            for state in states {
                println!("{:#?}", state);
            }
        }
        SubCommand::BuildOrder(order) => {
            let tree = RecipeTree::new(
                &order.checkout,
                config.source.packages_root(),
                config.source.recipe_dirs(),
            );

            let mut pkgs = Vec::new();
            for name in order.packages {
                let (_, recipe) = tree.load(&name).await?;
                let mut deps = recipe.dependency_names("depends");
                deps.extend(recipe.dependency_names("makedepends"));
                pkgs.push((name, deps));
            }

            for name in transaction::queue_order(&pkgs) {
                println!("{}", name);
            }
        }
        SubCommand::CheckConfig => {
            println!("{:#?}", config);
        }
    }

    Ok(())
}
