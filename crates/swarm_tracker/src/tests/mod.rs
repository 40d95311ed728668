mod scenarios;
mod sweeper;
