// svlink-core: IEC 61850-9-2 Sampled Value stream engine.
//
// COMTRADE ingest -> resampling -> SV frame encoding -> absolute-time
// transmission over a raw Layer-2 link, with a GOOSE listener that can stop
// an active stream.

pub mod comtrade;
pub mod iec61850;
pub mod link;
pub mod replay;
pub mod resample;
pub mod timer;
