/*!
# PlanetPlant DevKit - Doubles et utilitaires de test

Bibliothèque facilitant les tests du noyau d'irrigation sans broker ni stockage :
- Transport MQTT factice qui enregistre les commandes publiées
- Constructeurs de messages capteurs (télémétrie, heartbeat, statut)
- Harness câblant registre, moteur, santé et façade sur une horloge manuelle
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{FakeTransport, PlantMessageBuilder};
pub use test_utils::{FailingSink, TestHarness};
