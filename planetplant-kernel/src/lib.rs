/**
 * PLANETPLANT KERNEL - Noyau d'irrigation connecté
 *
 * RÔLE : Ingestion MQTT des capteurs sol/climat, état par capteur, moteur de
 * décision d'arrosage et santé système agrégée.
 *
 * ARCHITECTURE (feuilles -> racine) :
 * contracts/mqtt (passerelle) -> registry (état) -> engine (décision)
 * -> health (agrégation) -> service/http (surface de requête).
 * Chaque composant est construit une fois dans main.rs et injecté; les tests
 * remplacent transport et stockage par des doubles (voir le crate devkit).
 */

pub mod clock;
pub mod config;
pub mod contracts;
pub mod engine;
pub mod events;
pub mod health;
pub mod http;
pub mod ingest;
pub mod models;
pub mod mqtt;
pub mod registry;
pub mod service;
pub mod sink;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;
