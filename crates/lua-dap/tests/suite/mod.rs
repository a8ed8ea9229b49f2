mod breakpoints;
mod control;
mod exceptions;
mod handshake;
mod stepping;
mod variables;
